//! Bounded gzip inflation (RFC 1952).
//!
//! Gzip is a thin framing around a raw DEFLATE stream: a variable-length
//! header in front and an eight-byte trailer behind. The header is walked
//! by hand and the payload handed to the inflater with an output cap, so a
//! hostile response cannot balloon past the bottled-buffer limit. The
//! trailer checksum is not verified; a corrupt stream fails inflation on
//! its own.

use miniz_oxide::inflate::decompress_to_vec_with_limit;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const METHOD_DEFLATE: u8 = 0x08;

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xe0;

/// Failure to decode a gzip stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InflateError;

/// Skip past the gzip header, returning the offset of the deflate stream.
fn header_len(data: &[u8]) -> Result<usize, InflateError> {
    if data.len() < 10 || data[..2] != GZIP_MAGIC || data[2] != METHOD_DEFLATE {
        return Err(InflateError);
    }
    let flags = data[3];
    if flags & FRESERVED != 0 {
        return Err(InflateError);
    }

    // fixed header: magic, method, flags, mtime(4), xfl, os
    let mut pos = 10;

    if flags & FEXTRA != 0 {
        if data.len() < pos + 2 {
            return Err(InflateError);
        }
        let extra = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2 + extra;
    }
    if flags & FNAME != 0 {
        pos += nul_terminated(&data[pos.min(data.len())..])?;
    }
    if flags & FCOMMENT != 0 {
        pos += nul_terminated(&data[pos.min(data.len())..])?;
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }

    if pos >= data.len() {
        return Err(InflateError);
    }
    Ok(pos)
}

fn nul_terminated(data: &[u8]) -> Result<usize, InflateError> {
    match data.iter().position(|&b| b == 0) {
        Some(idx) => Ok(idx + 1),
        None => Err(InflateError),
    }
}

/// Inflate a gzip stream, bounding the output at `limit` bytes.
pub(crate) fn inflate_gzip(data: &[u8], limit: usize) -> Result<Vec<u8>, InflateError> {
    let start = header_len(data)?;
    decompress_to_vec_with_limit(&data[start..], limit).map_err(|_| InflateError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gzip(payload: &[u8]) -> Vec<u8> {
        let deflated = miniz_oxide::deflate::compress_to_vec(payload, 6);
        let mut out = vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];
        out.extend_from_slice(&deflated);
        // crc32 is not verified on inflate
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out
    }

    #[test]
    fn round_trip() {
        let body = b"the quick brown fox jumps over the lazy dog".repeat(32);
        let inflated = inflate_gzip(&gzip(&body), 1 << 20).unwrap();
        assert_eq!(inflated, body);
    }

    #[test]
    fn output_is_capped() {
        let body = vec![0u8; 64 * 1024];
        assert_eq!(inflate_gzip(&gzip(&body), 1024), Err(InflateError));
    }

    #[test]
    fn rejects_bad_magic() {
        assert_eq!(inflate_gzip(b"not gzip at all", 1024), Err(InflateError));
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(inflate_gzip(&[0x1f, 0x8b, 0x08], 1024), Err(InflateError));
    }

    #[test]
    fn skips_name_field() {
        let deflated = miniz_oxide::deflate::compress_to_vec(b"hi", 6);
        let mut data = vec![0x1f, 0x8b, 0x08, FNAME, 0, 0, 0, 0, 0x00, 0xff];
        data.extend_from_slice(b"file.txt\0");
        data.extend_from_slice(&deflated);
        data.extend_from_slice(&[0; 8]);
        assert_eq!(inflate_gzip(&data, 1024).unwrap(), b"hi");
    }
}
