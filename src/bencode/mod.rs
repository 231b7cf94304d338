//! Bencode codec
//!
//! Decoding and encoding of the binary format used by `.torrent` files and
//! HTTP tracker responses.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{decode, decode_with_info, Decoded};
pub use encode::{encode, encode_into};
pub use value::{Dict, Value};
