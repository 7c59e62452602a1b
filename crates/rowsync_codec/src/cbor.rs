//! CBOR encoding helpers.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Encode a value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer)
        .map_err(CodecError::write)?;
    Ok(buffer)
}

/// Decode a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(CodecError::read)
}

/// Encode a value as CBOR directly into a writer.
pub fn write_cbor<T: Serialize + ?Sized, W: Write>(value: &T, writer: W) -> CodecResult<()> {
    ciborium::ser::into_writer(value, writer)
        .map_err(CodecError::write)
}

/// Decode a CBOR value from a reader.
pub fn read_cbor<T: DeserializeOwned, R: Read>(reader: R) -> CodecResult<T> {
    ciborium::de::from_reader(reader).map_err(CodecError::read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        cells: Vec<Value>,
    }

    #[test]
    fn struct_roundtrip() {
        let sample = Sample {
            name: "Customer".into(),
            cells: vec![Value::Integer(1), Value::Null, Value::Bytes(vec![1, 2])],
        };
        let bytes = to_cbor(&sample).unwrap();
        let decoded: Sample = from_cbor(&bytes).unwrap();
        assert_eq!(sample, decoded);
    }

    #[test]
    fn writer_and_reader() {
        let mut buffer = Vec::new();
        write_cbor(&vec![1u64, 2, 3], &mut buffer).unwrap();
        let decoded: Vec<u64> = read_cbor(buffer.as_slice()).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn truncated_input_fails() {
        let bytes = to_cbor(&"a fairly long string").unwrap();
        let result: CodecResult<String> = from_cbor(&bytes[..4]);
        assert!(matches!(result, Err(CodecError::Read(_))));
    }
}
