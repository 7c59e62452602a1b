//! Stable content fingerprints.

use crate::cbor::to_cbor;
use crate::error::CodecResult;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Returns the lowercase hex SHA-256 of the CBOR encoding of `value`.
///
/// Struct fields are encoded in declaration order and callers keep their
/// collections ordered (`BTreeMap`, sorted `Vec`), so equal values always
/// produce equal fingerprints.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> CodecResult<String> {
    let bytes = to_cbor(value)?;
    Ok(fingerprint_bytes(&bytes))
}

/// Returns the lowercase hex SHA-256 of raw bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
