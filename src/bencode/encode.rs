//! Bencode encoder

use bytes::{BufMut, BytesMut};

use super::value::Value;

/// Encode a value into a fresh buffer
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.to_vec()
}

/// Append the canonical encoding of `value` to `buf`.
///
/// Dictionary keys come out sorted by their raw bytes because `Dict` is a
/// `BTreeMap<Vec<u8>, _>`.
pub fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Int(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(bytes) => put_bytes(buf, bytes),
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(dict) => {
            buf.put_u8(b'd');
            for (key, item) in dict {
                put_bytes(buf, key);
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Dict;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Int(0)), b"i0e");
        assert_eq!(encode(&Value::Int(-42)), b"i-42e");
        assert_eq!(encode(&Value::from("spam")), b"4:spam");
        assert_eq!(encode(&Value::List(vec![Value::Int(1), Value::from("a")])), b"li1e1:ae");
    }

    #[test]
    fn test_dict_keys_sorted() {
        let mut dict = Dict::new();
        dict.insert(b"b".to_vec(), Value::Int(1));
        dict.insert(b"a".to_vec(), Value::Int(2));
        assert_eq!(encode(&Value::Dict(dict)), b"d1:ai2e1:bi1ee");
    }

    #[test]
    fn test_dict_keys_sorted_by_raw_bytes() {
        let mut dict = Dict::new();
        dict.insert(b"a".to_vec(), Value::Int(1));
        dict.insert(b"B".to_vec(), Value::Int(2));
        dict.insert(b"ab".to_vec(), Value::Int(3));
        assert_eq!(encode(&Value::Dict(dict)), b"d1:Bi2e1:ai1e2:abi3ee");
    }
}
