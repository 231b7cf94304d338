//! Bencode decoder
//!
//! Besides the decoded tree, the decoder reports the raw byte range of the
//! top-level `info` value so the info-hash can be computed over the exact
//! bytes that were on disk.

use std::ops::Range;

use anyhow::Result;
use tracing::{trace, warn};

use super::value::{Dict, Value};
use crate::error::TorrentError;

/// Nesting limit for lists and dictionaries
const MAX_DEPTH: usize = 64;

/// Result of a decode that also tracks the `info` span
#[derive(Debug, Clone)]
pub struct Decoded {
    pub value: Value,
    /// Offset just past the decoded value
    pub next: usize,
    /// Raw `[start, end)` range of the top-level `info` value, if present
    pub info_span: Option<Range<usize>>,
}

/// Decode one value starting at `start`, returning it and the offset after it
pub fn decode(buf: &[u8], start: usize) -> Result<(Value, usize)> {
    let decoded = decode_with_info(buf, start)?;
    Ok((decoded.value, decoded.next))
}

/// Decode one value and capture the raw bytes of a top-level `info` entry
pub fn decode_with_info(buf: &[u8], start: usize) -> Result<Decoded> {
    trace!("Decoding bencode from offset {} of {} bytes", start, buf.len());
    let mut decoder = Decoder {
        buf,
        pos: start,
        depth: 0,
        truncated: false,
        info_span: None,
    };
    let value = decoder.value()?;
    Ok(Decoded {
        value,
        next: decoder.pos,
        info_span: decoder.info_span,
    })
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
    /// Set once a string ran past the end of the buffer
    truncated: bool,
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or_else(|| {
            TorrentError::parse_error_with_source("Unexpected end of data", format!("offset {}", self.pos)).into()
        })
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => self.bytes(),
            other => Err(TorrentError::parse_error_with_source(
                "Unknown bencode type",
                format!("byte 0x{:02x} at offset {}", other, self.pos),
            )
            .into()),
        }
    }

    fn int(&mut self) -> Result<Value> {
        let start = self.pos + 1;
        let end = self.find(b'e', start).ok_or_else(|| {
            TorrentError::parse_error_with_source("Unterminated integer", format!("offset {}", self.pos))
        })?;
        let digits = std::str::from_utf8(&self.buf[start..end])
            .map_err(|e| TorrentError::parse_error_with_source("Invalid integer", e.to_string()))?;
        let value: i64 = digits
            .parse()
            .map_err(|_| TorrentError::parse_error_with_source("Invalid integer", digits.to_string()))?;
        self.pos = end + 1;
        Ok(Value::Int(value))
    }

    fn bytes(&mut self) -> Result<Value> {
        Ok(Value::Bytes(self.byte_string()?))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>> {
        let colon = self.find(b':', self.pos).ok_or_else(|| {
            TorrentError::parse_error_with_source("Unterminated string length", format!("offset {}", self.pos))
        })?;
        let digits = std::str::from_utf8(&self.buf[self.pos..colon])
            .map_err(|e| TorrentError::parse_error_with_source("Invalid string length", e.to_string()))?;
        let length: usize = digits
            .parse()
            .map_err(|_| TorrentError::parse_error_with_source("Invalid string length", digits.to_string()))?;

        let start = colon + 1;
        match start.checked_add(length).filter(|&end| end <= self.buf.len()) {
            Some(end) => {
                self.pos = end;
                Ok(self.buf[start..end].to_vec())
            }
            None => {
                // Truncated tracker responses are tolerated: the string reads as empty.
                warn!(
                    "Bencode string of length {} at offset {} runs past end of buffer ({} bytes)",
                    length,
                    self.pos,
                    self.buf.len()
                );
                self.truncated = true;
                self.pos = self.buf.len();
                Ok(Vec::new())
            }
        }
    }

    fn list(&mut self) -> Result<Value> {
        self.enter()?;
        let mut items = Vec::new();
        loop {
            match self.buf.get(self.pos) {
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => items.push(self.value()?),
                None if self.truncated => break,
                None => {
                    return Err(TorrentError::parse_error("Unterminated list").into());
                }
            }
        }
        self.depth -= 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self) -> Result<Value> {
        self.enter()?;
        let mut dict = Dict::new();
        loop {
            match self.buf.get(self.pos) {
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(b'0'..=b'9') => {
                    let key = self.byte_string()?;
                    let value_start = self.pos;
                    let value = self.value()?;
                    if self.depth == 1 && key == b"info" {
                        self.info_span = Some(value_start..self.pos);
                    }
                    dict.insert(key, value);
                }
                Some(other) => {
                    return Err(TorrentError::parse_error_with_source(
                        "Dictionary key must be a byte string",
                        format!("byte 0x{:02x} at offset {}", other, self.pos),
                    )
                    .into());
                }
                None if self.truncated => break,
                None => {
                    return Err(TorrentError::parse_error("Unterminated dictionary").into());
                }
            }
        }
        self.depth -= 1;
        Ok(Value::Dict(dict))
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(TorrentError::parse_error_with_source("Nesting too deep", format!("limit {}", MAX_DEPTH)).into());
        }
        self.pos += 1;
        Ok(())
    }

    fn find(&self, needle: u8, from: usize) -> Option<usize> {
        self.buf
            .get(from..)?
            .iter()
            .position(|&b| b == needle)
            .map(|p| from + p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e", 0).unwrap(), (Value::Int(42), 4));
        assert_eq!(decode(b"i-7e", 0).unwrap(), (Value::Int(-7), 4));
        assert_eq!(decode(b"4:spam", 0).unwrap(), (Value::from("spam"), 6));
        assert_eq!(decode(b"0:", 0).unwrap(), (Value::Bytes(vec![]), 2));
    }

    #[test]
    fn test_decode_from_offset() {
        let (value, next) = decode(b"xxi9e", 2).unwrap();
        assert_eq!(value, Value::Int(9));
        assert_eq!(next, 5);
    }

    #[test]
    fn test_decode_nested() {
        let (value, next) = decode(b"d4:listli1ei2ee3:key5:valuee", 0).unwrap();
        assert_eq!(next, 28);
        assert_eq!(value.list_field("list").unwrap(), &[Value::Int(1), Value::Int(2)]);
        assert_eq!(value.string_field("key").unwrap(), "value");
    }

    #[test]
    fn test_info_span_covers_raw_bytes() {
        let data = b"d8:announce3:url4:infod4:name1:a6:lengthi5eee";
        let decoded = decode_with_info(data, 0).unwrap();
        let span = decoded.info_span.unwrap();
        assert_eq!(&data[span], b"d4:name1:a6:lengthi5ee");
    }

    #[test]
    fn test_info_span_ignores_nested_info_keys() {
        let data = b"d5:outerd4:infoi1eee";
        let decoded = decode_with_info(data, 0).unwrap();
        assert!(decoded.info_span.is_none());
    }

    #[test]
    fn test_unterminated_containers_fail() {
        assert!(decode(b"li1e", 0).is_err());
        assert!(decode(b"d3:keyi1e", 0).is_err());
        assert!(decode(b"i12", 0).is_err());
    }

    #[test]
    fn test_truncated_string_reads_as_empty() {
        let (value, next) = decode(b"10:abc", 0).unwrap();
        assert_eq!(value, Value::Bytes(vec![]));
        assert_eq!(next, 6);

        // a truncated compact peer list inside a tracker response
        let (value, _) = decode(b"d8:intervali1800e5:peers12:abcdef", 0).unwrap();
        assert_eq!(value.int_field("interval").unwrap(), 1800);
        assert_eq!(value.bytes_field("peers").unwrap(), b"");
    }

    #[test]
    fn test_non_string_key_fails() {
        assert!(decode(b"di1ei2ee", 0).is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut inner = Dict::new();
        inner.insert(b"path".to_vec(), Value::List(vec![Value::from("a"), Value::from("b.txt")]));
        inner.insert(b"length".to_vec(), Value::Int(1 << 40));
        let mut root = Dict::new();
        root.insert(b"files".to_vec(), Value::List(vec![Value::Dict(inner)]));
        root.insert(b"raw".to_vec(), Value::Bytes(vec![0, 255, 19, b'e']));
        root.insert(b"neg".to_vec(), Value::Int(-12));
        let value = Value::Dict(root);

        let bytes = encode(&value);
        let (decoded, next) = decode(&bytes, 0).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(next, bytes.len());
    }
}
