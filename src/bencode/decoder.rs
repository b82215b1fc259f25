//! Decodes a byte slice into a [`BencodeValue`], tracking the cursor
//! position so callers can recover the number of bytes consumed and detect
//! trailing garbage after the top-level value.
use std::collections::BTreeMap;

use tracing::instrument;

use super::{BencodeValue, DecodeError, DecodeResult};

/// Controls how strictly the dictionary-key ordering rule is enforced.
///
/// Outbound packets this process produces are always canonical, so
/// round-tripping our own output should use [`DecodeMode::Strict`]. Inbound
/// KRPC packets come from implementations of wildly varying quality; many
/// don't bother sorting dictionary keys, so the KRPC layer decodes those with
/// [`DecodeMode::Lenient`] rather than dropping otherwise-valid packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Strict,
    Lenient,
}

/// Decodes a single top-level value from `input` and returns it along with
/// the number of bytes consumed. Any bytes after the value are left
/// unexamined; pass `mode` consistently with how the data was produced.
#[instrument(skip(input), level = "trace")]
pub fn decode(input: &[u8], mode: DecodeMode) -> DecodeResult<(BencodeValue, usize)> {
    let mut cursor = Cursor { input, pos: 0, mode };
    let value = cursor.decode_value()?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
    mode: DecodeMode,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> DecodeResult<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::UnexpectedEof(self.pos))
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn take(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .input
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn expect_byte(&mut self, expected: u8) -> DecodeResult<()> {
        let actual = self.peek()?;
        if actual != expected {
            return Err(DecodeError::UnexpectedByte(self.pos, actual));
        }
        self.advance(1);
        Ok(())
    }

    fn decode_value(&mut self) -> DecodeResult<BencodeValue> {
        match self.peek()? {
            b'i' => self.decode_int().map(BencodeValue::Int),
            b'l' => self.decode_list().map(BencodeValue::List),
            b'd' => self.decode_dict().map(BencodeValue::Dict),
            b'0'..=b'9' => self.decode_bytes().map(BencodeValue::Bytes),
            other => Err(DecodeError::UnexpectedByte(self.pos, other)),
        }
    }

    /// `i<digits>e`. Rejects leading zeros (except the literal `i0e`) and
    /// negative zero, which are non-canonical and never produced by a
    /// well-behaved encoder.
    fn decode_int(&mut self) -> DecodeResult<i64> {
        let start = self.pos;
        self.expect_byte(b'i')?;

        let digits_start = self.pos;
        let negative = self.peek()? == b'-';
        if negative {
            self.advance(1);
        }

        let number_start = self.pos;
        loop {
            match self.peek()? {
                b'0'..=b'9' => self.advance(1),
                b'e' => break,
                _ => return Err(DecodeError::InvalidInteger(start)),
            }
        }
        let digits = &self.input[number_start..self.pos];
        if digits.is_empty() {
            return Err(DecodeError::InvalidInteger(start));
        }
        if digits == b"0" && negative {
            return Err(DecodeError::InvalidInteger(start));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(DecodeError::InvalidInteger(start));
        }
        let text = std::str::from_utf8(&self.input[digits_start..self.pos])
            .map_err(|_| DecodeError::InvalidInteger(start))?;
        let value = text
            .parse::<i64>()
            .map_err(|_| DecodeError::InvalidInteger(start))?;
        self.expect_byte(b'e')?;
        Ok(value)
    }

    /// `<len>:<bytes>`.
    fn decode_bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let start = self.pos;
        let len_start = self.pos;
        loop {
            match self.peek()? {
                b'0'..=b'9' => self.advance(1),
                b':' => break,
                _ => return Err(DecodeError::InvalidStringLength(start)),
            }
        }
        let len_digits = &self.input[len_start..self.pos];
        if len_digits.len() > 1 && len_digits[0] == b'0' {
            return Err(DecodeError::InvalidStringLength(start));
        }
        let len_text = std::str::from_utf8(len_digits)
            .map_err(|_| DecodeError::InvalidStringLength(start))?;
        let len = len_text
            .parse::<usize>()
            .map_err(|_| DecodeError::InvalidStringLength(start))?;
        self.expect_byte(b':')?;
        Ok(self.take(len)?.to_vec())
    }

    fn decode_list(&mut self) -> DecodeResult<Vec<BencodeValue>> {
        self.expect_byte(b'l')?;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.decode_value()?);
        }
        self.advance(1);
        Ok(items)
    }

    fn decode_dict(&mut self) -> DecodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
        self.expect_byte(b'd')?;
        let mut pairs: Vec<(Vec<u8>, BencodeValue)> = Vec::new();
        while self.peek()? != b'e' {
            let key_start = self.pos;
            let key = self.decode_bytes()?;
            let value = self.decode_value()?;

            if self.mode == DecodeMode::Strict {
                if let Some((last_key, _)) = pairs.last() {
                    match key.as_slice().cmp(last_key.as_slice()) {
                        std::cmp::Ordering::Less => {
                            return Err(DecodeError::UnsortedKeys(key_start))
                        }
                        std::cmp::Ordering::Equal => {
                            return Err(DecodeError::DuplicateKey(key_start))
                        }
                        std::cmp::Ordering::Greater => {}
                    }
                }
            }
            pairs.push((key, value));
        }
        self.advance(1);

        let mut map = BTreeMap::new();
        for (key, value) in pairs {
            // Lenient mode: last occurrence of a duplicate key wins, matching
            // how most sloppy DHT implementations' own dict types behave.
            map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::BencodeValue;

    fn decode_strict(input: &[u8]) -> DecodeResult<BencodeValue> {
        decode(input, DecodeMode::Strict).map(|(v, _)| v)
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(decode_strict(b"i42e").unwrap(), BencodeValue::Int(42));
        assert_eq!(decode_strict(b"i-42e").unwrap(), BencodeValue::Int(-42));
        assert_eq!(decode_strict(b"i0e").unwrap(), BencodeValue::Int(0));
    }

    #[test]
    fn rejects_non_canonical_integers() {
        assert!(decode_strict(b"i01e").is_err());
        assert!(decode_strict(b"i-0e").is_err());
        assert!(decode_strict(b"ie").is_err());
    }

    #[test]
    fn decodes_strings() {
        assert_eq!(
            decode_strict(b"4:spam").unwrap(),
            BencodeValue::Bytes(b"spam".to_vec())
        );
        assert_eq!(
            decode_strict(b"0:").unwrap(),
            BencodeValue::Bytes(Vec::new())
        );
    }

    #[test]
    fn decodes_lists_and_dicts() {
        assert_eq!(
            decode_strict(b"l4:spami42ee").unwrap(),
            BencodeValue::List(vec![
                BencodeValue::Bytes(b"spam".to_vec()),
                BencodeValue::Int(42)
            ])
        );

        let (value, consumed) = decode(b"d3:bar4:spam3:fooi42ee", DecodeMode::Strict).unwrap();
        assert_eq!(consumed, 22);
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.get(b"bar".as_slice()).unwrap().as_bytes(), Some(&b"spam"[..]));
        assert_eq!(dict.get(b"foo".as_slice()).unwrap().as_int(), Some(42));
    }

    #[test]
    fn strict_mode_rejects_unsorted_keys() {
        let result = decode_strict(b"d3:fooi1e3:bari2ee");
        assert!(matches!(result, Err(DecodeError::UnsortedKeys(_))));
    }

    #[test]
    fn strict_mode_rejects_duplicate_keys() {
        let result = decode_strict(b"d3:fooi1e3:fooi2ee");
        assert!(matches!(result, Err(DecodeError::DuplicateKey(_))));
    }

    #[test]
    fn lenient_mode_accepts_sloppy_dicts() {
        let (value, _) = decode(b"d3:fooi1e3:bari2ee", DecodeMode::Lenient).unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn reports_trailing_bytes_via_consumed_length() {
        let (value, consumed) = decode(b"i42egarbage", DecodeMode::Strict).unwrap();
        assert_eq!(value, BencodeValue::Int(42));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn unexpected_eof_is_reported() {
        assert!(matches!(
            decode_strict(b"4:sp"),
            Err(DecodeError::UnexpectedEof(_))
        ));
        assert!(matches!(
            decode_strict(b"i42"),
            Err(DecodeError::InvalidInteger(_)) | Err(DecodeError::UnexpectedEof(_))
        ));
    }
}
