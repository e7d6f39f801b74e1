use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::collections::BTreeMap;
use tracing::instrument;

/// Decodes a complete bencoded document.
///
/// The whole input must be consumed; trailing bytes after the top-level value
/// are rejected, because a `.torrent` file or tracker response is exactly one
/// value.
///
/// # Errors
/// Returns a [`BencodeError`] on truncated input, a non-digit string length
/// prefix, an unterminated container, or a missing `:` separator. Leading
/// zeros in integers are accepted; real-world torrents contain them even
/// though BEP 3 forbids them.
#[instrument(skip(data), level = "debug")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let (end, value) = decode_value(data, 0)?;
    if end != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes the bencoded value at the start of `data`, returning it together
/// with the number of bytes consumed.
///
/// Extension protocol data messages append raw piece bytes directly after a
/// bencoded dictionary, so their parsers need to know where the dictionary
/// ends.
pub fn decode_prefix(data: &[u8]) -> BencodeResult<(usize, BencodeValue)> {
    decode_value(data, 0)
}

/// Returns the exact byte span of the value stored under `key` in a
/// top-level bencoded dictionary.
///
/// This is the basis of info-hash computation: the span is returned as it
/// appeared on the wire, without a decode/re-encode round trip that could
/// reorder keys or normalize integers.
#[instrument(skip(data), level = "debug")]
pub fn raw_value<'a>(data: &'a [u8], key: &[u8]) -> BencodeResult<&'a [u8]> {
    if data.first() != Some(&b'd') {
        return Err(BencodeError::InvalidFormat(
            "Top-level value is not a dictionary".to_string(),
        ));
    }
    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        let (value_pos, current_key) = decode_string(data, pos)?;
        let (next_pos, _) = decode_value(data, value_pos)?;
        if current_key == key {
            return Ok(&data[value_pos..next_pos]);
        }
        pos = next_pos;
    }
    Err(BencodeError::KeyNotFound)
}

/// Decodes the bencode value starting at `pos`, returning the position one
/// past its end together with the value.
fn decode_value(data: &[u8], pos: usize) -> BencodeResult<(usize, BencodeValue)> {
    match data.get(pos) {
        Some(b'0'..=b'9') => {
            let (end, s) = decode_string(data, pos)?;
            Ok((end, BencodeValue::String(s.to_vec())))
        }
        Some(b'i') => {
            let (end, i) = decode_integer(data, pos)?;
            Ok((end, BencodeValue::Integer(i)))
        }
        Some(b'l') => decode_list(data, pos),
        Some(b'd') => decode_dict(data, pos),
        Some(&other) => Err(BencodeError::InvalidFormat(format!(
            "Unexpected character: {}",
            other as char
        ))),
        None => Err(BencodeError::UnexpectedEOI),
    }
}

/// Decodes a string in the format `<length>:<data>`.
fn decode_string(data: &[u8], pos: usize) -> BencodeResult<(usize, &[u8])> {
    let sep = data[pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|i| pos + i)
        .ok_or(BencodeError::UnexpectedEOI)?;
    let length_str =
        std::str::from_utf8(&data[pos..sep]).map_err(|_| BencodeError::InvalidStringLength)?;
    if length_str.is_empty() || !length_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidStringLength);
    }
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    let end = sep + 1 + length;
    if end > data.len() {
        return Err(BencodeError::UnexpectedEOI);
    }
    Ok((end, &data[sep + 1..end]))
}

/// Decodes an integer in the format `i<number>e`.
///
/// Leading zeros are tolerated, deviating from strict BEP 3.
fn decode_integer(data: &[u8], pos: usize) -> BencodeResult<(usize, i64)> {
    let end = data[pos..]
        .iter()
        .position(|&b| b == b'e')
        .map(|i| pos + i)
        .ok_or(BencodeError::UnexpectedEOI)?;
    let num_str =
        std::str::from_utf8(&data[pos + 1..end]).map_err(|_| BencodeError::InvalidInteger)?;
    if num_str.is_empty() || num_str == "-" {
        return Err(BencodeError::InvalidInteger);
    }
    let value = num_str
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger)?;
    Ok((end + 1, value))
}

/// Decodes a list in the format `l<items>e`.
fn decode_list(data: &[u8], pos: usize) -> BencodeResult<(usize, BencodeValue)> {
    let mut items = Vec::new();
    let mut pos = pos + 1;
    loop {
        match data.get(pos) {
            Some(b'e') => return Ok((pos + 1, BencodeValue::List(items))),
            Some(_) => {
                let (next, item) = decode_value(data, pos)?;
                items.push(item);
                pos = next;
            }
            None => return Err(BencodeError::UnexpectedEOI),
        }
    }
}

/// Decodes a dictionary in the format `d<key><value>...e`. Keys must be
/// strings.
fn decode_dict(data: &[u8], pos: usize) -> BencodeResult<(usize, BencodeValue)> {
    let mut dict = BTreeMap::new();
    let mut pos = pos + 1;
    loop {
        match data.get(pos) {
            Some(b'e') => return Ok((pos + 1, BencodeValue::Dict(dict))),
            Some(_) => {
                let (value_pos, key) = decode_string(data, pos)?;
                let (next, value) = decode_value(data, value_pos)?;
                dict.insert(key.to_vec(), value);
                pos = next;
            }
            None => return Err(BencodeError::UnexpectedEOI),
        }
    }
}
