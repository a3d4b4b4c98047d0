// Bencode parsing and serialization.
//
// Values are decoded into an explicit tree (Int / Bytes / List / Dict)
// borrowing from the input buffer. Dicts preserve the order they appear in
// on the wire; encoding always emits keys sorted, so encode(decode(x)) == x
// holds for canonically encoded input.

use std::collections::BTreeMap;
use std::ops::Range;

// Parsing is recursive; torrent files in the wild don't nest anywhere near
// this deep.
const MAX_DEPTH: usize = 32;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Eof,
    #[error("unexpected byte {0:#x} at offset {1}")]
    UnexpectedByte(u8, usize),
    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),
    #[error("leading zero in integer at offset {0}")]
    LeadingZero(usize),
    #[error("invalid string length at offset {0}")]
    InvalidLength(usize),
    #[error("dict key is not a string at offset {0}")]
    NonStringKey(usize),
    #[error("trailing {0} bytes after value")]
    TrailingBytes(usize),
    #[error("nesting too deep")]
    TooDeep,
}

/// A borrowed bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Int(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(Vec<(&'a [u8], Value<'a>)>),
}

impl<'a> Value<'a> {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(&'a [u8], Value<'a>)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dict lookup. First occurrence wins if a non-conforming encoder
    /// repeated a key.
    pub fn get(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.as_dict()?
            .iter()
            .find_map(|(k, v)| (*k == key).then_some(v))
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key)?.as_int()
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&'a [u8]> {
        self.get(key)?.as_bytes()
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&'a str> {
        self.get(key)?.as_str()
    }

    pub fn to_owned(&self) -> OwnedValue {
        match self {
            Value::Int(v) => OwnedValue::Int(*v),
            Value::Bytes(b) => OwnedValue::Bytes(b.to_vec()),
            Value::List(l) => OwnedValue::List(l.iter().map(Value::to_owned).collect()),
            Value::Dict(d) => OwnedValue::Dict(
                d.iter()
                    .map(|(k, v)| (k.to_vec(), v.to_owned()))
                    .collect(),
            ),
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(b'i');
                out.extend_from_slice(itoa(*v).as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => encode_bytes(b, out),
            Value::List(l) => {
                out.push(b'l');
                for v in l {
                    v.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(d) => {
                let mut pairs: Vec<_> = d.iter().collect();
                pairs.sort_by_key(|(k, _)| *k);
                out.push(b'd');
                for (k, v) in pairs {
                    encode_bytes(k, out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

/// An owned bencode value, used when building messages to send. The BTreeMap
/// keeps encode output sorted for free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<OwnedValue>),
    Dict(BTreeMap<Vec<u8>, OwnedValue>),
}

impl OwnedValue {
    pub fn str(s: &str) -> Self {
        OwnedValue::Bytes(s.as_bytes().to_vec())
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            OwnedValue::Int(v) => {
                out.push(b'i');
                out.extend_from_slice(itoa(*v).as_bytes());
                out.push(b'e');
            }
            OwnedValue::Bytes(b) => encode_bytes(b, out),
            OwnedValue::List(l) => {
                out.push(b'l');
                for v in l {
                    v.encode_into(out);
                }
                out.push(b'e');
            }
            OwnedValue::Dict(d) => {
                out.push(b'd');
                for (k, v) in d {
                    encode_bytes(k, out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

fn encode_bytes(b: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(itoa(b.len() as i64).as_bytes());
    out.push(b':');
    out.extend_from_slice(b);
}

fn itoa(v: i64) -> String {
    v.to_string()
}

/// Decode a single value; trailing bytes are an error.
pub fn decode(buf: &[u8]) -> Result<Value<'_>, DecodeError> {
    let (value, consumed) = decode_prefix(buf)?;
    if consumed != buf.len() {
        return Err(DecodeError::TrailingBytes(buf.len() - consumed));
    }
    Ok(value)
}

/// Decode a single value from the front of the buffer, returning how many
/// bytes it occupied.
pub fn decode_prefix(buf: &[u8]) -> Result<(Value<'_>, usize), DecodeError> {
    let mut p = Parser {
        buf,
        pos: 0,
        info_span: None,
    };
    let value = p.parse_value(0)?;
    Ok((value, p.pos))
}

/// Decode a top-level dict, additionally reporting the byte range its
/// "info" entry occupied in the input. The caller hashes that exact slice
/// to get the info-hash.
pub fn decode_with_info_span(buf: &[u8]) -> Result<(Value<'_>, Option<Range<usize>>), DecodeError> {
    let mut p = Parser {
        buf,
        pos: 0,
        info_span: None,
    };
    let value = p.parse_value(0)?;
    if p.pos != buf.len() {
        return Err(DecodeError::TrailingBytes(buf.len() - p.pos));
    }
    Ok((value, p.info_span))
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    info_span: Option<Range<usize>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::Eof)
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value<'a>, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.parse_value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut pairs = Vec::new();
                while self.peek()? != b'e' {
                    let key_pos = self.pos;
                    let key = match self.peek()? {
                        b'0'..=b'9' => self.parse_bytes()?,
                        _ => return Err(DecodeError::NonStringKey(key_pos)),
                    };
                    let value_start = self.pos;
                    let value = self.parse_value(depth + 1)?;
                    if depth == 0 && key == b"info" {
                        self.info_span = Some(value_start..self.pos);
                    }
                    pairs.push((key, value));
                }
                self.pos += 1;
                Ok(Value::Dict(pairs))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?)),
            other => Err(DecodeError::UnexpectedByte(other, self.pos)),
        }
    }

    fn parse_int(&mut self) -> Result<Value<'a>, DecodeError> {
        let start = self.pos;
        self.pos += 1; // 'i'
        let end = memchr::memchr(b'e', &self.buf[self.pos..])
            .map(|i| self.pos + i)
            .ok_or(DecodeError::Eof)?;
        let digits = &self.buf[self.pos..end];
        let (negative, digits) = match digits.split_first() {
            Some((b'-', rest)) => (true, rest),
            _ => (false, digits),
        };
        if digits.is_empty() {
            return Err(DecodeError::InvalidInteger(start));
        }
        if digits[0] == b'0' && (digits.len() > 1 || negative) {
            // "i03e" and "i-0e" are both rejected.
            return Err(DecodeError::LeadingZero(start));
        }
        let magnitude: i64 =
            atoi::atoi(digits).ok_or(DecodeError::InvalidInteger(start))?;
        self.pos = end + 1;
        Ok(Value::Int(if negative { -magnitude } else { magnitude }))
    }

    fn parse_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let start = self.pos;
        let colon = memchr::memchr(b':', &self.buf[self.pos..])
            .map(|i| self.pos + i)
            .ok_or(DecodeError::Eof)?;
        let digits = &self.buf[self.pos..colon];
        if digits.is_empty() || (digits[0] == b'0' && digits.len() > 1) {
            return Err(DecodeError::InvalidLength(start));
        }
        let len: usize = atoi::atoi(digits).ok_or(DecodeError::InvalidLength(start))?;
        let data_start = colon + 1;
        let data_end = data_start.checked_add(len).ok_or(DecodeError::Eof)?;
        if data_end > self.buf.len() {
            return Err(DecodeError::Eof);
        }
        self.pos = data_end;
        Ok(&self.buf[data_start..data_end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-42e").unwrap(), Value::Int(-42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"4:spam").unwrap(), Value::Bytes(b"spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(b""));
    }

    #[test]
    fn test_decode_strict() {
        assert_eq!(decode(b"i03e").unwrap_err(), DecodeError::LeadingZero(0));
        assert_eq!(decode(b"i-0e").unwrap_err(), DecodeError::LeadingZero(0));
        assert_eq!(decode(b"ie").unwrap_err(), DecodeError::InvalidInteger(0));
        assert_eq!(decode(b"01:a").unwrap_err(), DecodeError::InvalidLength(0));
        assert_eq!(decode(b"5:spam").unwrap_err(), DecodeError::Eof);
        assert_eq!(
            decode(b"i1ei2e").unwrap_err(),
            DecodeError::TrailingBytes(3)
        );
        assert_eq!(
            decode(b"di1ei2ee").unwrap_err(),
            DecodeError::NonStringKey(1)
        );
    }

    #[test]
    fn test_decode_nested() {
        let v = decode(b"d4:spaml1:a1:bei42ei7ee").unwrap_err();
        // key "i42e" is an int, not a string
        assert!(matches!(v, DecodeError::NonStringKey(_)));

        let v = decode(b"d3:bari7e4:spaml1:a1:bee").unwrap();
        assert_eq!(v.get_int(b"bar"), Some(7));
        assert_eq!(
            v.get(b"spam").unwrap().as_list().unwrap(),
            &[Value::Bytes(b"a"), Value::Bytes(b"b")]
        );
    }

    #[test]
    fn test_decode_prefix() {
        let (v, consumed) = decode_prefix(b"i42etrailing").unwrap();
        assert_eq!(v, Value::Int(42));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_encode_roundtrip() {
        let cases: &[&[u8]] = &[
            b"i42e",
            b"4:spam",
            b"l4:spam4:eggse",
            b"d3:cow3:moo4:spam4:eggse",
            b"d4:spamld3:fooi1eeee",
        ];
        for case in cases {
            let v = decode(case).unwrap();
            assert_eq!(&v.encode(), case);
        }
    }

    #[test]
    fn test_encode_sorts_keys() {
        // Decoded dicts keep wire order; re-encoding sorts.
        let v = decode(b"d4:spam4:eggs3:cow3:mooe").unwrap();
        assert_eq!(&v.encode(), b"d3:cow3:moo4:spam4:eggse");

        let mut d = BTreeMap::new();
        d.insert(b"zz".to_vec(), OwnedValue::Int(1));
        d.insert(b"aa".to_vec(), OwnedValue::str("x"));
        assert_eq!(&OwnedValue::Dict(d).encode(), b"d2:aa1:x2:zzi1ee");
    }

    #[test]
    fn test_info_span() {
        let buf: &[u8] = b"d8:announce3:url4:infod4:name1:a6:lengthi5eee";
        let (v, span) = decode_with_info_span(buf).unwrap();
        let span = span.unwrap();
        assert_eq!(&buf[span.clone()], b"d4:name1:a6:lengthi5ee");
        assert_eq!(decode(&buf[span]).unwrap(), *v.get(b"info").unwrap());
    }

    #[test]
    fn test_too_deep() {
        let mut buf = Vec::new();
        buf.extend(std::iter::repeat(b'l').take(100));
        buf.extend(std::iter::repeat(b'e').take(100));
        assert_eq!(decode(&buf).unwrap_err(), DecodeError::TooDeep);
    }
}
