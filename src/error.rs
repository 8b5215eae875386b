use std::fmt;
use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Outcome classes for operations on a non-blocking connection. `Wait` is the
/// would-block indication and is never surfaced to a peer; `Close` is a clean
/// peer shutdown; everything in `Fatal` tears the connection down.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Close,
    Fatal(Fault),
}

#[derive(Debug, Eq, PartialEq)]
pub enum Fault {
    Io(io::ErrorKind),
    /// The stream can no longer be framed (corrupt record, truncated header).
    Decode,
    Encode,
    /// Handshake named a codec the registry does not know.
    UnknownCodec,
    /// A record exceeded the sanity cap.
    Oversize(usize),
    /// The negotiation blob itself could not be parsed.
    Handshake,
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(Fault::Io(kind)),
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetError::Wait => write!(f, "operation would block"),
            NetError::Close => write!(f, "connection closed by peer"),
            NetError::Fatal(fault) => write!(f, "fatal connection error: {:?}", fault),
        }
    }
}

/// Errors produced while resolving `Service.Method` names. These are soft:
/// they travel back to the peer in the response header and the connection
/// stays up.
#[derive(Debug, Eq, PartialEq)]
pub enum DispatchError {
    IllFormed(String),
    NoService(String),
    NoMethod(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::IllFormed(name) => {
                write!(f, "rpc server: service/method request ill-formed: {}", name)
            }
            DispatchError::NoService(name) => write!(f, "rpc server: can't find service {}", name),
            DispatchError::NoMethod(name) => write!(f, "rpc server: can't find method{}", name),
        }
    }
}

/// The error channel for registered methods; its message is copied into the
/// response header verbatim.
#[derive(Debug, Eq, PartialEq)]
pub struct ServiceError(pub String);

impl ServiceError {
    #[inline]
    pub fn new<S: Into<String>>(message: S) -> ServiceError {
        ServiceError(message.into())
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceError {
    fn from(message: &str) -> Self {
        ServiceError(message.to_string())
    }
}

impl From<String> for ServiceError {
    fn from(message: String) -> Self {
        ServiceError(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_folds_to_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetError::Wait);
    }

    #[test]
    fn other_io_errors_are_fatal() {
        let err: NetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetError::Fatal(Fault::Io(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn dispatch_errors_render_the_wire_strings() {
        assert_eq!(
            DispatchError::IllFormed("ArithSum".to_string()).to_string(),
            "rpc server: service/method request ill-formed: ArithSum"
        );
        assert_eq!(
            DispatchError::NoService("Arith".to_string()).to_string(),
            "rpc server: can't find service Arith"
        );
        assert_eq!(
            DispatchError::NoMethod("Arith.Mul".to_string()).to_string(),
            "rpc server: can't find methodArith.Mul"
        );
    }
}
