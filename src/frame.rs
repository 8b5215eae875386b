//! Stream framing: the one-time length-prefixed handshake frame plus the
//! buffered fill/drain primitives every connection is built on. After the
//! handshake frame both directions are raw; the negotiated codec delimits
//! its own records.

use std::io;

use crate::buffer::Buffer;
use crate::codec::{CodecError, MAX_RECORD};
use crate::error::{NetError, NetResult};

// Leaves headroom above the record cap so an oversized record is diagnosed
// by the codec rather than wedging the read loop.
pub(crate) const READ_CAP: usize = MAX_RECORD + 64 * 1024;

/// Read whatever the stream currently has into `buf`. `Wait` when nothing was
/// available, `Close` on a zero-byte read with nothing gathered.
pub fn fill<R: io::Read>(buf: &mut Buffer, stream: R) -> NetResult<usize> {
    match buf.ingress(stream, READ_CAP) {
        Ok(0) => Err(NetError::Close),
        Ok(count) => Ok(count),
        Err(err) => Err(err.into()),
    }
}

/// Push buffered output to the stream. `Ok` only when the buffer fully
/// drained; `Wait` when the stream blocked part-way, leaving the remainder
/// buffered for the next attempt.
pub fn drain<W: io::Write>(buf: &mut Buffer, stream: W) -> NetResult<()> {
    match buf.egress(stream) {
        Ok(_) => {
            if buf.is_empty() {
                Ok(())
            } else {
                Err(NetError::Wait)
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Prefix the negotiation blob with its one-byte length. Only the connecting
/// side ever writes this frame.
pub fn write_handshake<W: io::Write>(mut stream: W, blob: &[u8]) -> io::Result<()> {
    if blob.is_empty() || blob.len() > 255 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "handshake blob must be 1..=255 bytes",
        ));
    }
    stream.write_all(&[blob.len() as u8])?;
    stream.write_all(blob)
}

/// Split the negotiation blob off the head of the buffered bytes; returns the
/// blob and the bytes consumed including the prefix.
pub fn take_handshake(bytes: &[u8]) -> Result<(&[u8], usize), CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Incomplete);
    }

    let length = bytes[0] as usize;
    if length == 0 {
        return Err(CodecError::Corrupt("zero-length handshake frame".to_string()));
    }
    if bytes.len() < 1 + length {
        return Err(CodecError::Incomplete);
    }

    Ok((&bytes[1..1 + length], 1 + length))
}
