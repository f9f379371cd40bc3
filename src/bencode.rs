//! Bencode codec
//!
//! Decoder and canonical encoder for the self-describing dictionary format
//! used by .torrent files and HTTP tracker responses. The decoder is kept
//! strict so that re-encoding a parsed value reproduces the input byte for
//! byte: dictionary keys must arrive in ascending raw-byte order with no
//! duplicates, and integers admit exactly one spelling.
//!
//! Wire forms:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ClientError, ProtocolErrorKind, Result};

/// Maximum accepted length for a single byte string (100 MiB).
/// Caps allocation on hostile length prefixes.
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// Maximum container nesting depth accepted by the decoder.
const MAX_DEPTH: usize = 64;

/// A decoded bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer value (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// Ordered sequence of values
    List(Vec<BencodeValue>),
    /// Mapping with byte-string keys, kept sorted by raw bytes
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 50 => write!(f, "Bytes(\"{}\")", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

/// Decode a complete bencode value, rejecting trailing input.
pub fn decode(input: &[u8]) -> Result<BencodeValue> {
    let (value, rest) = decode_prefix(input)?;
    if !rest.is_empty() {
        return Err(parse_error(format!("trailing data: {} bytes", rest.len())));
    }
    Ok(value)
}

/// Decode one bencode value from the front of `input`, returning the
/// remaining unparsed bytes.
pub fn decode_prefix(input: &[u8]) -> Result<(BencodeValue, &[u8])> {
    let mut cursor = Cursor::new(input);
    let value = cursor.value(0)?;
    Ok((value, cursor.rest()))
}

/// Encode a value into canonical bencode bytes.
///
/// Integers are minimal, strings use their natural length, and dictionary
/// keys are emitted in ascending raw-byte order, so every value has exactly
/// one encoding.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

/// Encode a value, appending to an existing buffer.
pub fn encode_into(value: &BencodeValue, buf: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(n) => {
            buf.push(b'i');
            buf.extend_from_slice(n.to_string().as_bytes());
            buf.push(b'e');
        }
        BencodeValue::Bytes(b) => {
            buf.extend_from_slice(b.len().to_string().as_bytes());
            buf.push(b':');
            buf.extend_from_slice(b);
        }
        BencodeValue::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        BencodeValue::Dict(entries) => {
            buf.push(b'd');
            for (key, val) in entries {
                buf.extend_from_slice(key.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(key);
                encode_into(val, buf);
            }
            buf.push(b'e');
        }
    }
}

fn parse_error(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::BencodeParse, message)
}

/// One-byte-lookahead recursive-descent decoder over a positional cursor.
struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8> {
        let byte = self
            .peek()
            .ok_or_else(|| parse_error("unexpected end of input"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.input.len() - self.pos {
            return Err(parse_error(format!(
                "length {} exceeds remaining input ({} bytes)",
                len,
                self.input.len() - self.pos
            )));
        }
        let slice = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(parse_error("nesting too deep"));
        }

        match self.peek() {
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dict(depth),
            Some(b'0'..=b'9') => self.bytes().map(BencodeValue::Bytes),
            Some(tag) => Err(parse_error(format!(
                "invalid type marker: {:?}",
                tag as char
            ))),
            None => Err(parse_error("empty input")),
        }
    }

    /// Parse an integer: `i<number>e`, no leading zeros, no `-0`.
    fn integer(&mut self) -> Result<BencodeValue> {
        self.bump()?; // 'i'

        let start = self.pos;
        let negative = self.peek() == Some(b'-');
        if negative {
            self.bump()?;
        }

        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }

        if self.pos == digits_start {
            return Err(parse_error("integer has no digits"));
        }
        match self.bump()? {
            b'e' => {}
            other => {
                return Err(parse_error(format!(
                    "non-digit {:?} in integer body",
                    other as char
                )))
            }
        }

        let body = &self.input[start..self.pos - 1];
        let digits = &self.input[digits_start..self.pos - 1];
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(parse_error("integer has leading zero"));
        }
        if negative && digits == b"0" {
            return Err(parse_error("negative zero integer"));
        }

        let text = std::str::from_utf8(body).expect("integer body is ASCII");
        let value = text
            .parse::<i64>()
            .map_err(|_| parse_error(format!("integer out of range: {}", text)))?;
        Ok(BencodeValue::Integer(value))
    }

    /// Parse a byte string: `<length>:<raw-bytes>`.
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            return Err(parse_error("string length has no digits"));
        }
        match self.bump()? {
            b':' => {}
            other => {
                return Err(parse_error(format!(
                    "non-digit {:?} in string length",
                    other as char
                )))
            }
        }

        let digits = &self.input[digits_start..self.pos - 1];
        // A redundant leading zero would break decode-encode identity, and
        // with it the info-hash byte-range equivalence.
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(parse_error("string length has leading zero"));
        }
        let text = std::str::from_utf8(digits).expect("length digits are ASCII");
        let len = text
            .parse::<usize>()
            .map_err(|_| parse_error(format!("string length out of range: {}", text)))?;
        if len > MAX_STRING_LENGTH {
            return Err(parse_error(format!(
                "string length {} exceeds cap of {} bytes",
                len, MAX_STRING_LENGTH
            )));
        }

        Ok(self.take(len)?.to_vec())
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue> {
        self.bump()?; // 'l'

        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::List(items));
                }
                Some(_) => items.push(self.value(depth + 1)?),
                None => return Err(parse_error("unterminated list")),
            }
        }
    }

    fn dict(&mut self, depth: usize) -> Result<BencodeValue> {
        self.bump()?; // 'd'

        let mut entries = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::Dict(entries));
                }
                Some(b'0'..=b'9') => {
                    let key = self.bytes()?;
                    // Strictly ascending keys: rejects duplicates too.
                    if let Some(ref prev) = last_key {
                        if &key <= prev {
                            return Err(parse_error("duplicate or out-of-order dict key"));
                        }
                    }
                    let value = self.value(depth + 1)?;
                    last_key = Some(key.clone());
                    entries.insert(key, value);
                }
                Some(_) => return Err(parse_error("dict key must be a byte string")),
                None => return Err(parse_error("unterminated dict")),
            }
        }
    }
}

impl BencodeValue {
    /// Get as UTF-8 string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as raw bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get dict value by string key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));

        assert!(decode(b"i03e").is_err()); // leading zero
        assert!(decode(b"i-0e").is_err()); // negative zero
        assert!(decode(b"i-01e").is_err()); // leading zero after minus
        assert!(decode(b"ie").is_err()); // no digits
        assert!(decode(b"i42").is_err()); // unterminated
        assert!(decode(b"i4x2e").is_err()); // non-digit body
    }

    #[test]
    fn test_decode_bytes() {
        assert_eq!(
            decode(b"4:spam").unwrap(),
            BencodeValue::Bytes(b"spam".to_vec())
        );
        assert_eq!(decode(b"0:").unwrap(), BencodeValue::Bytes(vec![]));
        assert_eq!(
            decode(b"5:\x00\x01\x02\x03\x04").unwrap(),
            BencodeValue::Bytes(vec![0, 1, 2, 3, 4])
        );

        assert!(decode(b"5:spam").is_err()); // length past end of input
        assert!(decode(b"4spam").is_err()); // missing colon
        assert!(decode(b"+4:spam").is_err()); // sign is not a digit
        assert!(decode(b"04:spam").is_err()); // redundant leading zero
    }

    #[test]
    fn test_decode_lists() {
        let value = decode(b"l4:spami42ee").unwrap();
        assert_eq!(
            value,
            BencodeValue::List(vec![
                BencodeValue::Bytes(b"spam".to_vec()),
                BencodeValue::Integer(42),
            ])
        );

        assert_eq!(decode(b"le").unwrap(), BencodeValue::List(vec![]));
        assert!(decode(b"l4:spam").is_err()); // unterminated
    }

    #[test]
    fn test_decode_dicts() {
        let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(value.get("cow").and_then(|v| v.as_str()), Some("moo"));
        assert_eq!(value.get("spam").and_then(|v| v.as_str()), Some("eggs"));

        assert_eq!(decode(b"de").unwrap(), BencodeValue::Dict(BTreeMap::new()));
        assert!(decode(b"d3:cow3:moo").is_err()); // unterminated
        assert!(decode(b"di1e3:mooe").is_err()); // non-string key
    }

    #[test]
    fn test_dict_key_ordering() {
        // Keys out of order
        assert!(decode(b"d3:zzz1:a3:aaa1:be").is_err());
        // Duplicate keys rejected by the same strict ordering check
        assert!(decode(b"d3:cow3:moo3:cow4:eggse").is_err());
        // In-order keys accepted
        assert!(decode(b"d3:aaa1:a3:zzz1:be").is_ok());
    }

    #[test]
    fn test_trailing_data() {
        assert!(decode(b"i42ei43e").is_err());

        let (value, rest) = decode_prefix(b"i42ei43e").unwrap();
        assert_eq!(value, BencodeValue::Integer(42));
        assert_eq!(rest, b"i43e");
    }

    #[test]
    fn test_encode_canonical() {
        assert_eq!(encode(&BencodeValue::Integer(42)), b"i42e");
        assert_eq!(encode(&BencodeValue::Integer(-7)), b"i-7e");
        assert_eq!(encode(&BencodeValue::Bytes(b"spam".to_vec())), b"4:spam");

        let mut dict = BTreeMap::new();
        dict.insert(b"spam".to_vec(), BencodeValue::Bytes(b"eggs".to_vec()));
        dict.insert(b"cow".to_vec(), BencodeValue::Bytes(b"moo".to_vec()));
        // BTreeMap iteration yields keys sorted regardless of insert order
        assert_eq!(encode(&BencodeValue::Dict(dict)), b"d3:cow3:moo4:spam4:eggse");
    }

    #[test]
    fn test_roundtrip() {
        let inputs: &[&[u8]] = &[
            b"i0e",
            b"0:",
            b"d3:cow3:moo4:spam4:eggse",
            b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee",
            b"lld3:fooi1eeee",
        ];
        for input in inputs {
            let value = decode(input).unwrap();
            assert_eq!(encode(&value), *input, "roundtrip for {:?}", input);
        }
    }

    #[test]
    fn test_depth_cap() {
        let mut hostile = Vec::new();
        hostile.extend(std::iter::repeat(b'l').take(MAX_DEPTH + 8));
        hostile.extend(std::iter::repeat(b'e').take(MAX_DEPTH + 8));
        assert!(decode(&hostile).is_err());
    }

    #[test]
    fn test_accessors() {
        let value = decode(b"d4:listli1ei2ei3ee4:name4:test3:numi42ee").unwrap();
        assert_eq!(value.get("num").and_then(|v| v.as_int()), Some(42));
        assert_eq!(value.get("num").and_then(|v| v.as_uint()), Some(42));
        assert_eq!(value.get("name").and_then(|v| v.as_str()), Some("test"));
        assert_eq!(
            value.get("list").and_then(|v| v.as_list()).map(|l| l.len()),
            Some(3)
        );
        assert!(value.get("missing").is_none());
    }
}
