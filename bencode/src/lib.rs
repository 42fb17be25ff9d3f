//! Bencode codec.
//!
//! Decoding borrows from the input buffer and produces a [`ValueRef`] tree;
//! encoding goes through the streaming [`DictEncoder`]/[`ListEncoder`]
//! builders which write directly into a `Vec<u8>` without an intermediate
//! tree. Dictionary keys are raw byte strings and compare bytewise, which is
//! also the canonical wire ordering.

mod decode;
mod encode;
mod error;

pub use crate::decode::{Dict, ValueRef};
pub use crate::encode::{encode_bytes, encode_int, DictEncoder, Encode, ListEncoder};
pub use crate::error::{Error, Result};
