//! Message codecs: header+body framing over a negotiated wire format.

pub mod bin;
pub mod json;

use std::any::Any;
use std::fmt;
use std::io;

use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};

/// Records above this are treated as stream corruption rather than data.
pub(crate) const MAX_RECORD: usize = 64 << 20;

/// Per-message envelope. Field names are fixed by the wire protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "ServiceMethod")]
    pub service_method: String,
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(rename = "Error")]
    pub error: String,
}

impl Header {
    #[inline]
    pub fn new<S: Into<String>>(service_method: S, seq: u64) -> Header {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }
}

/// The negotiation blob carried by the length-prefixed handshake frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "CodecType")]
    pub codec_type: String,
}

/// Decoding and encoding outcomes. `Incomplete` means the buffered bytes do
/// not yet hold a whole record; the caller reads more and retries, which is
/// what makes decoding resumable across readiness edges. `Value` means the
/// record was consumed but its payload did not fit the expected type (soft,
/// reported to the peer); `Corrupt` means the stream can no longer be framed.
#[derive(Debug, PartialEq)]
pub enum CodecError {
    Incomplete,
    Value { consumed: usize, message: String },
    Corrupt(String),
    Encode(String),
    Oversize(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Incomplete => write!(f, "record incomplete"),
            CodecError::Value { message, .. } => write!(f, "invalid value: {}", message),
            CodecError::Corrupt(message) => write!(f, "corrupt stream: {}", message),
            CodecError::Encode(message) => write!(f, "encode error: {}", message),
            CodecError::Oversize(size) => write!(f, "record of {} bytes over cap", size),
        }
    }
}

impl From<CodecError> for crate::error::NetError {
    fn from(err: CodecError) -> Self {
        use crate::error::{Fault, NetError};

        match err {
            CodecError::Incomplete => NetError::Wait,
            CodecError::Oversize(size) => NetError::Fatal(Fault::Oversize(size)),
            CodecError::Encode(_) => NetError::Fatal(Fault::Encode),
            CodecError::Value { .. } | CodecError::Corrupt(_) => NetError::Fatal(Fault::Decode),
        }
    }
}

/// A type-erased request argument or reply. Implemented once, by
/// [`BodyCell`]; the per-format hooks let the two codecs drive typed serde
/// decoding without knowing the concrete type.
pub trait Body: Send {
    /// Decode one JSON value from the head of `bytes`; returns the number of
    /// bytes consumed.
    fn decode_json(&mut self, bytes: &[u8]) -> Result<usize, CodecError>;

    /// Decode exactly the supplied binary record.
    fn decode_bin(&mut self, record: &[u8]) -> Result<(), CodecError>;

    /// Append the value as one JSON record.
    fn encode_json(&self, dst: &mut dyn io::Write) -> Result<(), CodecError>;

    /// Append the value as one length-prefixed binary record.
    fn encode_bin(&self, dst: &mut dyn io::Write) -> Result<(), CodecError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Carrier tying a concrete serde type to the [`Body`] erasure. Materializing
/// a `Default` value mirrors zero-value argument/reply construction: maps and
/// sequences start empty, numbers at zero.
#[derive(Default)]
pub struct BodyCell<T> {
    pub value: T,
}

impl<T> BodyCell<T> {
    #[inline]
    pub fn new(value: T) -> BodyCell<T> {
        BodyCell { value }
    }
}

impl<T> Body for BodyCell<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    fn decode_json(&mut self, bytes: &[u8]) -> Result<usize, CodecError> {
        let (value, consumed) = json::decode_value(bytes)?;
        self.value = value;
        Ok(consumed)
    }

    fn decode_bin(&mut self, record: &[u8]) -> Result<(), CodecError> {
        self.value = bin::decode_value(record)?;
        Ok(())
    }

    fn encode_json(&self, dst: &mut dyn io::Write) -> Result<(), CodecError> {
        json::encode_value(&self.value, dst)
    }

    fn encode_bin(&self, dst: &mut dyn io::Write) -> Result<(), CodecError> {
        bin::encode_value(&self.value, dst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Decoder half of a connection's codec. Operates on the connection's read
/// buffer; never touches the socket.
pub trait Decode: Send {
    /// Parse one header record from the head of `bytes`; returns the header
    /// and the bytes consumed.
    fn read_header(&mut self, bytes: &[u8]) -> Result<(Header, usize), CodecError>;

    /// Parse one body record from the head of `bytes` into `body`, or skip
    /// the record when `body` is `None`; returns the bytes consumed.
    fn read_body(
        &mut self,
        bytes: &[u8],
        body: Option<&mut dyn Body>,
    ) -> Result<usize, CodecError>;
}

/// Encoder half of a connection's codec. Appends one whole message (header
/// then body) to the write buffer; the connection flushes it afterwards so
/// the stream sees complete messages per call.
pub trait Encode: Send {
    fn write(
        &mut self,
        dst: &mut dyn io::Write,
        header: &Header,
        body: Option<&dyn Body>,
    ) -> Result<(), CodecError>;
}

pub type CodecParts = (Box<dyn Decode>, Box<dyn Encode>);

pub type CodecFn = fn() -> CodecParts;

/// Explicit name → factory table handed to servers and clients at
/// construction. `with_defaults` knows the two built-in formats.
#[derive(Clone)]
pub struct CodecRegistry {
    factories: HashMap<String, CodecFn>,
}

impl CodecRegistry {
    pub fn new() -> CodecRegistry {
        CodecRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> CodecRegistry {
        let mut registry = CodecRegistry::new();
        registry.register("json", json::new);
        registry.register("bin", bin::new);
        registry
    }

    pub fn register<S: Into<String>>(&mut self, name: S, factory: CodecFn) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiate the named codec, or `None` for an unknown name.
    pub fn create(&self, name: &str) -> Option<CodecParts> {
        self.factories.get(name).map(|factory| factory())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_builtin_formats() {
        let registry = CodecRegistry::with_defaults();
        assert!(registry.create("json").is_some());
        assert!(registry.create("bin").is_some());
        assert!(registry.create("gob").is_none());
    }

    #[test]
    fn header_serializes_with_wire_field_names() {
        let header = Header::new("Arith.Sum", 7);
        let encoded = serde_json::to_string(&header).unwrap();
        assert_eq!(
            encoded,
            r#"{"ServiceMethod":"Arith.Sum","Seq":7,"Error":""}"#
        );
    }
}
