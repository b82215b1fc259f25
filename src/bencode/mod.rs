//! Bencoding codec: the wire encoding used by KRPC (BEP-5).
//!
//! Bencoding has four value kinds: integers (`i<decimal>e`), byte strings
//! (`<len>:<bytes>`), lists (`l<items>e`) and dictionaries (`d<k,v>*e`).
//! Dictionary keys are always byte strings and, on the wire, must appear in
//! strictly ascending byte-lexicographic order with no duplicates.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded (or to-be-encoded) Bencode value.
///
/// Dictionaries use a `BTreeMap` so that encoding a freshly-built value is
/// canonical (keys byte-sorted) without any extra bookkeeping. Decoding still
/// has to validate key order and duplicates *before* folding pairs into the
/// map, since a `BTreeMap` alone can't tell a strictly-sorted input apart
/// from one that merely sorted the same under insertion (see
/// [`decoder::DecodeMode`]).
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a dict entry by an ASCII key name, saving call sites from
    /// spelling `.as_dict()?.get(key.as_bytes())` for every KRPC field.
    pub fn dict_get(&self, key: &str) -> Option<&BencodeValue> {
        self.as_dict()?.get(key.as_bytes())
    }
}

/// Builds a `BencodeValue::Dict` from `(&str, BencodeValue)` pairs.
#[macro_export]
macro_rules! bdict {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = std::collections::BTreeMap::new();
        $(map.insert($key.as_bytes().to_vec(), $value);)*
        $crate::bencode::BencodeValue::Dict(map)
    }};
}

/// Error produced while decoding a bencoded byte string.
///
/// Carries the byte offset at which the problem was detected so a caller can
/// report or log precisely where a peer's packet went wrong.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("invalid integer at byte {0}")]
    InvalidInteger(usize),

    #[error("invalid string length at byte {0}")]
    InvalidStringLength(usize),

    #[error("unexpected byte 0x{1:02x} at byte {0}")]
    UnexpectedByte(usize, u8),

    #[error("dictionary keys out of order at byte {0}")]
    UnsortedKeys(usize),

    #[error("duplicate dictionary key at byte {0}")]
    DuplicateKey(usize),
}

/// Error produced while encoding a [`BencodeValue`].
///
/// The value type has no non-encodable shape today, so this exists purely as
/// a forward-compatible error surface (mirrors the source codec, which
/// carried a `CannotEncodeType` variant for the same reason).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum EncodeError {
    #[error("cannot encode value of kind: {0}")]
    CannotEncodeType(&'static str),
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;
