//! Decoded bencode values
//!
//! Accessors come in two flavours: `as_*` returns `Option` for probing, and
//! the `*_field` helpers return a `ParseError` naming the missing or mistyped
//! key, which is what descriptor and tracker parsing want.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::error::TorrentError;

/// Dictionary keyed by raw byte strings; `BTreeMap` keeps keys in canonical order
pub type Dict = BTreeMap<Vec<u8>, Value>;

/// A bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string as UTF-8, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a key when this value is a dictionary
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }

    /// Required dictionary entry
    pub fn field(&self, key: &str) -> Result<&Value> {
        let dict = self
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error_with_source("Expected a dictionary", format!("looking up '{}'", key)))?;
        dict.get(key.as_bytes())
            .ok_or_else(|| TorrentError::parse_error_with_source("Missing key", key.to_string()).into())
    }

    pub fn int_field(&self, key: &str) -> Result<i64> {
        self.field(key)?
            .as_int()
            .ok_or_else(|| TorrentError::parse_error_with_source("Expected an integer", key.to_string()).into())
    }

    pub fn bytes_field(&self, key: &str) -> Result<&[u8]> {
        self.field(key)?
            .as_bytes()
            .ok_or_else(|| TorrentError::parse_error_with_source("Expected a byte string", key.to_string()).into())
    }

    /// Byte string field decoded lossily as text
    pub fn string_field(&self, key: &str) -> Result<String> {
        Ok(String::from_utf8_lossy(self.bytes_field(key)?).into_owned())
    }

    pub fn list_field(&self, key: &str) -> Result<&[Value]> {
        self.field(key)?
            .as_list()
            .ok_or_else(|| TorrentError::parse_error_with_source("Expected a list", key.to_string()).into())
    }

    pub fn dict_field(&self, key: &str) -> Result<&Dict> {
        self.field(key)?
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error_with_source("Expected a dictionary", key.to_string()).into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Bytes(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Dict> for Value {
    fn from(value: Dict) -> Self {
        Value::Dict(value)
    }
}
