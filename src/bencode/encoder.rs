//! Encodes a [`BencodeValue`] into its canonical bencode byte string.
//!
//! Canonical here means dictionary keys are written in ascending
//! byte-lexicographic order — automatic since [`BencodeValue::Dict`] is a
//! `BTreeMap` — and integers/strings use their single valid textual form.
use tracing::instrument;

use super::{BencodeValue, EncodeResult};

/// Encodes `value` and appends the bytes to `out`.
#[instrument(skip(out, value), level = "trace")]
pub fn encode_into(out: &mut Vec<u8>, value: &BencodeValue) -> EncodeResult<()> {
    match value {
        BencodeValue::Int(i) => encode_int(out, *i),
        BencodeValue::Bytes(b) => encode_bytes(out, b),
        BencodeValue::List(items) => encode_list(out, items)?,
        BencodeValue::Dict(map) => encode_dict(out, map)?,
    }
    Ok(())
}

/// Encodes `value` into a freshly allocated buffer.
pub fn encode(value: &BencodeValue) -> EncodeResult<Vec<u8>> {
    let mut out = Vec::new();
    encode_into(&mut out, value)?;
    Ok(out)
}

fn encode_int(out: &mut Vec<u8>, i: i64) {
    out.push(b'i');
    out.extend_from_slice(i.to_string().as_bytes());
    out.push(b'e');
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn encode_list(out: &mut Vec<u8>, items: &[BencodeValue]) -> EncodeResult<()> {
    out.push(b'l');
    for item in items {
        encode_into(out, item)?;
    }
    out.push(b'e');
    Ok(())
}

fn encode_dict(
    out: &mut Vec<u8>,
    map: &std::collections::BTreeMap<Vec<u8>, BencodeValue>,
) -> EncodeResult<()> {
    out.push(b'd');
    // BTreeMap iterates in key order already, so no explicit sort is needed.
    for (key, value) in map {
        encode_bytes(out, key);
        encode_into(out, value)?;
    }
    out.push(b'e');
    Ok(())
}
