use std::io;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use serde_json::error::Category;

use super::{Body, CodecError, CodecParts, Decode, Encode, Header, MAX_RECORD};

/// Self-describing text codec: each record is one JSON value, newline
/// separated. Truncated input surfaces as `Incomplete`, so decoding resumes
/// once more bytes arrive.
pub fn new() -> CodecParts {
    (Box::new(JsonDecode), Box::new(JsonEncode))
}

pub struct JsonDecode;

pub struct JsonEncode;

impl Decode for JsonDecode {
    fn read_header(&mut self, bytes: &[u8]) -> Result<(Header, usize), CodecError> {
        decode_value(bytes).map_err(|err| match err {
            // A header that parses as JSON but not as a header desyncs the
            // stream just as badly as syntax garbage.
            CodecError::Value { message, .. } => CodecError::Corrupt(message),
            other => other,
        })
    }

    fn read_body(
        &mut self,
        bytes: &[u8],
        body: Option<&mut dyn Body>,
    ) -> Result<usize, CodecError> {
        match body {
            Some(body) => body.decode_json(bytes),
            None => skip_value(bytes),
        }
    }
}

impl Encode for JsonEncode {
    fn write(
        &mut self,
        dst: &mut dyn io::Write,
        header: &Header,
        body: Option<&dyn Body>,
    ) -> Result<(), CodecError> {
        encode_value(header, dst)?;
        if let Some(body) = body {
            body.encode_json(dst)?;
        }
        Ok(())
    }
}

/// Decode one JSON value from the head of `bytes`, returning the value and
/// the bytes consumed.
pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), CodecError> {
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<T>();

    match stream.next() {
        None => incomplete(bytes),
        Some(Ok(value)) => {
            let consumed = stream.byte_offset();
            Ok((value, consumed))
        }
        Some(Err(err)) => {
            if err.is_eof() {
                return incomplete(bytes);
            }
            match err.classify() {
                // The value is structurally sound JSON of the wrong shape:
                // consume the record and report it softly.
                Category::Data => {
                    let consumed = skip_value(bytes)?;
                    Err(CodecError::Value {
                        consumed,
                        message: err.to_string(),
                    })
                }
                _ => Err(CodecError::Corrupt(err.to_string())),
            }
        }
    }
}

/// Consume one JSON value without materializing it.
pub(crate) fn skip_value(bytes: &[u8]) -> Result<usize, CodecError> {
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<IgnoredAny>();

    match stream.next() {
        None => incomplete(bytes),
        Some(Ok(_)) => Ok(stream.byte_offset()),
        Some(Err(err)) => {
            if err.is_eof() {
                incomplete(bytes)
            } else {
                Err(CodecError::Corrupt(err.to_string()))
            }
        }
    }
}

pub(crate) fn encode_value<T: Serialize + ?Sized>(
    value: &T,
    dst: &mut dyn io::Write,
) -> Result<(), CodecError> {
    serde_json::to_writer(&mut *dst, value).map_err(|err| CodecError::Encode(err.to_string()))?;
    dst.write_all(b"\n")
        .map_err(|err| CodecError::Encode(err.to_string()))
}

#[inline]
fn incomplete<T>(bytes: &[u8]) -> Result<T, CodecError> {
    // An unfinished record that already exceeds the cap will never complete.
    if bytes.len() >= MAX_RECORD {
        Err(CodecError::Oversize(bytes.len()))
    } else {
        Err(CodecError::Incomplete)
    }
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
        let (_, mut enc) = new();
        let mut dst = Vec::new();
        let body = BodyCell::new(Args { a: 3, b: 4 });
        enc.write(&mut dst, &Header::new("Arith.Sum", 1), Some(&body))
            .unwrap();
        dst
    }

    #[test]
    fn round_trips_header_and_body() {
        let bytes = encoded_message();
        let (_, mut enc) = new();
        let mut dec = JsonDecode;

        let (header, consumed) = dec.read_header(&bytes).unwrap();
        assert_eq!(header, Header::new("Arith.Sum", 1));

        let mut body = BodyCell::<Args>::default();
        let used = dec.read_body(&bytes[consumed..], Some(&mut body)).unwrap();
        assert_eq!(body.value, Args { a: 3, b: 4 });
        assert_eq!(consumed + used, bytes.len());

        // The stream stays aligned for the next message.
        let mut second = bytes.clone();
        enc.write(&mut second, &Header::new("Arith.Sum", 2), None)
            .unwrap();
        let (next, _) = dec.read_header(&second[consumed + used..]).unwrap();
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn truncated_input_is_incomplete_at_every_split() {
        let bytes = encoded_message();
        let mut dec = JsonDecode;

        for split in 0..bytes.len() - 1 {
            let result = dec.read_header(&bytes[..split]);
            if let Err(CodecError::Incomplete) = result {
                continue;
            }
            // Splits past the header boundary parse the header fine; the
            // remainder is an incomplete body until only the trailing
            // newline is missing.
            let (_, consumed) = result.unwrap();
            let mut body = BodyCell::<Args>::default();
            match dec.read_body(&bytes[consumed..split], Some(&mut body)) {
                Err(CodecError::Incomplete) => (),
                Ok(_) => assert_eq!(split, bytes.len() - 1),
                other => panic!("unexpected body outcome {:?}", other),
            }
        }
    }

    #[test]
    fn wrong_shape_body_is_soft_and_consumes_the_record() {
        let mut dec = JsonDecode;
        let bytes = b"\"not an args struct\"\n{\"a\":1,\"b\":2}\n";

        let mut body = BodyCell::<Args>::default();
        match dec.read_body(bytes, Some(&mut body)) {
            Err(CodecError::Value { consumed, .. }) => {
                let rest = &bytes[consumed..];
                let mut next = BodyCell::<Args>::default();
                dec.read_body(rest, Some(&mut next)).unwrap();
                assert_eq!(next.value, Args { a: 1, b: 2 });
            }
            other => panic!("expected soft value error, got {:?}", other),
        }
    }

    #[test]
    fn syntax_garbage_is_corrupt() {
        let mut dec = JsonDecode;
        match dec.read_header(b"}}}{{{") {
            Err(CodecError::Corrupt(_)) => (),
            other => panic!("expected corrupt stream, got {:?}", other),
        }
    }

    #[test]
    fn skip_consumes_exactly_one_value() {
        let consumed = skip_value(b"{\"x\":[1,2,3]}\nnull\n").unwrap();
        assert_eq!(&b"{\"x\":[1,2,3]}\nnull\n"[consumed..consumed + 5], b"\nnull");
    }
}
