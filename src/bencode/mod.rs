//! Bencode codec for the BitTorrent protocol.
//!
//! Bencode is the self-delimiting format used by `.torrent` files, tracker
//! responses, and the extension protocol. This module provides a tree
//! representation ([`BencodeValue`]), a decoder, an encoder, and
//! [`decoder::raw_value`], which returns the exact byte span of a top-level
//! dictionary entry. That exactness matters: the info hash is the SHA-1 of
//! the `info` value as it appeared on the wire, so re-encoding is not an
//! option.
use std::collections::BTreeMap;
use thiserror::Error;
pub mod decoder;
pub mod encoder;

pub use decoder::{decode, raw_value};
pub use encoder::{encode, encode_to_bytes};

/// A bencoded value.
///
/// Dictionary keys are byte strings; a `BTreeMap` keeps them in the ascending
/// lexicographic order that BEP 3 mandates for encoding, so a decode/encode
/// round trip of a well-formed document is byte-exact.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    /// Returns the dictionary entry for `key`, if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        match self {
            BencodeValue::Dict(d) => d.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Custom error type for bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid string length")]
    InvalidStringLength,

    #[error("Unexpected end of input")]
    UnexpectedEOI,

    #[error("Trailing data after value")]
    TrailingData,

    #[error("Key not present in dictionary")]
    KeyNotFound,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
