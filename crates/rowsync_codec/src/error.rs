//! Failures of value checks and of CBOR conversion.

use crate::value::DataType;
use thiserror::Error;

/// Result of a codec call.
pub type CodecResult<T> = Result<T, CodecError>;

/// A value could not be written, read back, or stored in its column.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// ciborium refused to serialize a value or a batch part.
    #[error("cannot write cbor: {0}")]
    Write(String),

    /// Bytes did not decode into the expected shape. Usually a truncated or
    /// foreign batch file.
    #[error("cannot read cbor: {0}")]
    Read(String),

    /// Non-null value of another type than its column.
    #[error("{found} value given for {column} column")]
    WrongType {
        /// Declared column type.
        column: DataType,
        /// Type of the value.
        found: DataType,
    },

    /// Text (in characters) or bytes longer than the column's max length.
    #[error("{column} value of length {len} exceeds {max}")]
    TooLong {
        /// Declared column type.
        column: DataType,
        /// Declared max length.
        max: usize,
        /// Actual length.
        len: usize,
    },
}

impl CodecError {
    pub(crate) fn write(error: impl ToString) -> Self {
        Self::Write(error.to_string())
    }

    /// Builds a read failure from any decoder error.
    pub fn read(error: impl ToString) -> Self {
        Self::Read(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_column_type() {
        let err = CodecError::WrongType {
            column: DataType::Integer,
            found: DataType::Text,
        };
        assert_eq!(err.to_string(), "text value given for integer column");
        let err = CodecError::TooLong {
            column: DataType::Text,
            max: 4,
            len: 5,
        };
        assert_eq!(err.to_string(), "text value of length 5 exceeds 4");
    }
}
