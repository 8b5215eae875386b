use std::io;

use bincode::Options;
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Body, CodecError, CodecParts, Decode, Encode, Header, MAX_RECORD};

/// Binary streaming codec: every record is a u32 little-endian length prefix
/// followed by a bincode payload. The explicit delimiting is what lets the
/// decoder skip records it cannot type and detect incompleteness without
/// touching decoder state.
pub fn new() -> CodecParts {
    (Box::new(BinDecode), Box::new(BinEncode))
}

pub struct BinDecode;

pub struct BinEncode;

impl Decode for BinDecode {
    fn read_header(&mut self, bytes: &[u8]) -> Result<(Header, usize), CodecError> {
        let (record, consumed) = read_record(bytes)?;
        match decode_value(record) {
            Ok(header) => Ok((header, consumed)),
            // A record that does not decode as a header desyncs the stream.
            Err(CodecError::Value { message, .. }) => Err(CodecError::Corrupt(message)),
            Err(other) => Err(other),
        }
    }

    fn read_body(
        &mut self,
        bytes: &[u8],
        body: Option<&mut dyn Body>,
    ) -> Result<usize, CodecError> {
        let (record, consumed) = read_record(bytes)?;
        match body {
            Some(body) => match body.decode_bin(record) {
                Ok(()) => Ok(consumed),
                Err(CodecError::Value { message, .. }) => Err(CodecError::Value {
                    consumed,
                    message,
                }),
                Err(other) => Err(other),
            },
            None => Ok(consumed),
        }
    }
}

impl Encode for BinEncode {
    fn write(
        &mut self,
        dst: &mut dyn io::Write,
        header: &Header,
        body: Option<&dyn Body>,
    ) -> Result<(), CodecError> {
        encode_value(header, dst)?;
        if let Some(body) = body {
            body.encode_bin(dst)?;
        }
        Ok(())
    }
}

/// Split one length-prefixed record off the head of `bytes`; returns the
/// payload slice and the total bytes consumed including the prefix.
fn read_record(bytes: &[u8]) -> Result<(&[u8], usize), CodecError> {
    if bytes.len() < 4 {
        return Err(CodecError::Incomplete);
    }

    let length = LittleEndian::read_u32(&bytes[..4]) as usize;
    if length > MAX_RECORD {
        return Err(CodecError::Oversize(length));
    }
    if bytes.len() < 4 + length {
        return Err(CodecError::Incomplete);
    }

    Ok((&bytes[4..4 + length], 4 + length))
}

/// Decode a whole record payload. Any failure is a soft value error; the
/// record boundary came from the prefix, so the stream itself stays sound.
pub(crate) fn decode_value<T: DeserializeOwned>(record: &[u8]) -> Result<T, CodecError> {
    bincode::options()
        .deserialize(record)
        .map_err(|err| CodecError::Value {
            consumed: 0,
            message: err.to_string(),
        })
}

pub(crate) fn encode_value<T: Serialize + ?Sized>(
    value: &T,
    dst: &mut dyn io::Write,
) -> Result<(), CodecError> {
    let payload = bincode::options()
        .serialize(value)
        .map_err(|err| CodecError::Encode(err.to_string()))?;

    if payload.len() > MAX_RECORD {
        return Err(CodecError::Oversize(payload.len()));
    }

    let mut prefix = [0u8; 4];
    LittleEndian::write_u32(&mut prefix, payload.len() as u32);
    dst.write_all(&prefix)
        .and_then(|()| dst.write_all(&payload))
        .map_err(|err| CodecError::Encode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BodyCell;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Args {
        a: i32,
        b: i32,
    }

    fn encoded_message() -> Vec<u8> {
        let mut dst = Vec::new();
        let body = BodyCell::new(Args { a: 3, b: 4 });
        BinEncode
            .write(&mut dst, &Header::new("Arith.Sum", 9), Some(&body))
            .unwrap();
        dst
    }

    #[test]
    fn round_trips_header_and_body() {
        let bytes = encoded_message();
        let mut dec = BinDecode;

        let (header, consumed) = dec.read_header(&bytes).unwrap();
        assert_eq!(header, Header::new("Arith.Sum", 9));

        let mut body = BodyCell::<Args>::default();
        let used = dec.read_body(&bytes[consumed..], Some(&mut body)).unwrap();
        assert_eq!(body.value, Args { a: 3, b: 4 });
        assert_eq!(consumed + used, bytes.len());
    }

    #[test]
    fn every_truncation_is_incomplete() {
        let bytes = encoded_message();
        let mut dec = BinDecode;

        for split in 0..bytes.len() {
            match dec.read_header(&bytes[..split]) {
                Err(CodecError::Incomplete) => (),
                Ok((_, consumed)) => {
                    let mut body = BodyCell::<Args>::default();
                    assert_eq!(
                        dec.read_body(&bytes[consumed..split], Some(&mut body)),
                        Err(CodecError::Incomplete)
                    );
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[test]
    fn skip_advances_past_unknown_records() {
        let bytes = encoded_message();
        let mut dec = BinDecode;

        let (_, consumed) = dec.read_header(&bytes).unwrap();
        let used = dec.read_body(&bytes[consumed..], None).unwrap();
        assert_eq!(consumed + used, bytes.len());
    }

    #[test]
    fn mistyped_body_is_soft_and_reports_the_record_length() {
        let bytes = encoded_message();
        let mut dec = BinDecode;
        let (_, consumed) = dec.read_header(&bytes).unwrap();

        // A record holding Args will not decode as a String.
        let mut body = BodyCell::<String>::default();
        match dec.read_body(&bytes[consumed..], Some(&mut body)) {
            Err(CodecError::Value { consumed: used, .. }) => {
                assert_eq!(consumed + used, bytes.len())
            }
            other => panic!("expected soft value error, got {:?}", other),
        }
    }

    #[test]
    fn oversize_prefix_is_rejected() {
        let mut bytes = vec![0u8; 8];
        LittleEndian::write_u32(&mut bytes[..4], (MAX_RECORD + 1) as u32);
        match BinDecode.read_header(&bytes) {
            Err(CodecError::Oversize(_)) => (),
            other => panic!("expected oversize, got {:?}", other),
        }
    }

    #[test]
    fn empty_record_decodes_as_unit() {
        let mut dst = Vec::new();
        encode_value(&(), &mut dst).unwrap();
        assert_eq!(dst, vec![0, 0, 0, 0]);
        let (record, consumed) = read_record(&dst).unwrap();
        assert!(record.is_empty());
        assert_eq!(consumed, 4);
        let _: () = decode_value(record).unwrap();
    }
}
