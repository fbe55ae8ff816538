//! Encoder and decoder for FastCGI name-value pairs.
//!
//! Each pair is encoded as `name_len`, `value_len`, name bytes, value
//! bytes. A length is a single byte when below 128, otherwise 4 bytes
//! Big Endian with the high bit of the first byte set; the largest
//! encodable length is `2^31 - 1`.
//!
//! [`encode_pairs`] packs pairs into `PARAMS`-sized payload chunks,
//! splitting at pair boundaries wherever possible.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::MAX_CONTENT_LEN;
use crate::error::{FastgateError, Result};

/// The bit indicating the 4-byte length encoding.
const LONG_BIT: u8 = 1 << 7;

/// The maximum length a name or value may have.
pub const MAX_PAIR_LEN: usize = (1 << 31) - 1;

/// Append one variably-encoded length to `out`.
fn put_len(out: &mut BytesMut, len: usize) -> Result<()> {
    if len > MAX_PAIR_LEN {
        return Err(FastgateError::Protocol(format!(
            "name-value length {len} exceeds the encodable maximum"
        )));
    }
    if len < usize::from(LONG_BIT) {
        out.put_u8(len as u8);
    } else {
        let mut e = (len as u32).to_be_bytes();
        e[0] |= LONG_BIT;
        out.put_slice(&e);
    }
    Ok(())
}

/// Read one variably-encoded length from `buf` at `pos`, advancing `pos`.
///
/// Returns `None` when `buf` ends mid-length (the stream is truncated).
fn get_len(buf: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *buf.get(*pos)?;
    if first & LONG_BIT == 0 {
        *pos += 1;
        return Some(usize::from(first));
    }
    let raw = buf.get(*pos..*pos + 4)?;
    *pos += 4;
    let v = u32::from_be_bytes([raw[0] & !LONG_BIT, raw[1], raw[2], raw[3]]);
    Some(v as usize)
}

/// Encode one `(name, value)` pair into `out`.
pub fn encode_pair(out: &mut BytesMut, name: &[u8], value: &[u8]) -> Result<()> {
    put_len(out, name.len())?;
    put_len(out, value.len())?;
    out.put_slice(name);
    out.put_slice(value);
    Ok(())
}

/// Encode pairs into `PARAMS` payload chunks of at most 65,535 bytes.
///
/// Pairs never straddle a chunk boundary unless a single pair's encoding
/// alone exceeds the record content limit, in which case that pair is
/// split mid-encoding (the pair stream is reassembled by concatenation on
/// the far side).
pub fn encode_pairs<'a, I>(pairs: I) -> Result<Vec<Bytes>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut chunks = Vec::new();
    let mut current = BytesMut::new();

    for (name, value) in pairs {
        let mut encoded = BytesMut::new();
        encode_pair(&mut encoded, name.as_bytes(), value.as_bytes())?;

        if current.len() + encoded.len() > MAX_CONTENT_LEN && !current.is_empty() {
            chunks.push(current.freeze());
            current = BytesMut::new();
        }

        if encoded.len() <= MAX_CONTENT_LEN {
            current.extend_from_slice(&encoded);
        } else {
            // Oversized pair: emit it alone, fragmented at the limit.
            let mut rest: Bytes = encoded.freeze();
            while !rest.is_empty() {
                let take = rest.len().min(MAX_CONTENT_LEN);
                chunks.push(rest.split_to(take));
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current.freeze());
    }
    Ok(chunks)
}

/// Decode a concatenated pair stream back into `(name, value)` pairs.
///
/// # Errors
/// Fails with `Protocol` if the stream is truncated mid-pair or a name
/// is not valid UTF-8 (values are passed through lossily; CGI variable
/// names are always ASCII).
pub fn decode_pairs(buf: &[u8]) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let truncated = || FastgateError::Protocol("truncated name-value pair stream".into());

        let name_len = get_len(buf, &mut pos).ok_or_else(truncated)?;
        let value_len = get_len(buf, &mut pos).ok_or_else(truncated)?;

        let name = buf.get(pos..pos + name_len).ok_or_else(truncated)?;
        pos += name_len;
        let value = buf.get(pos..pos + value_len).ok_or_else(truncated)?;
        pos += value_len;

        let name = std::str::from_utf8(name)
            .map_err(|_| FastgateError::Protocol("non-UTF-8 variable name".into()))?;
        out.push((name.to_owned(), String::from_utf8_lossy(value).into_owned()));
    }

    Ok(out)
}
