//! # rowsync Codec
//!
//! Cell values and CBOR codecs for rowsync.
//!
//! This crate provides:
//! - [`Value`], the dynamically typed content of one column of one row
//! - [`DataType`], the declared type of a column or filter parameter
//! - CBOR helpers used for batch part files, scope records and HTTP bodies
//! - Stable fingerprints used to version a sync setup
//!
//! Floats are deliberately not representable: every value must have a
//! total order so that it can take part in a primary key, and every encoding
//! must be byte-identical across platforms so fingerprints stay stable.
//!
//! ## Usage
//!
//! ```
//! use rowsync_codec::{from_cbor, to_cbor, Value};
//!
//! let row = vec![Value::Integer(1), Value::Text("A".into())];
//! let bytes = to_cbor(&row).unwrap();
//! let decoded: Vec<Value> = from_cbor(&bytes).unwrap();
//! assert_eq!(row, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod fingerprint;
mod value;

pub use cbor::{from_cbor, read_cbor, to_cbor, write_cbor};
pub use error::{CodecError, CodecResult};
pub use fingerprint::{fingerprint, fingerprint_bytes};
pub use value::{DataType, Value};
