//! LZF compression, the sub-encoding RDB uses for strings and packed-list
//! blobs above a minimum size.
//!
//! This is a straightforward from-scratch LZ77 variant using the same
//! token shapes as the reference `liblzf` format: a control byte under
//! `0x20` starts a literal run (`ctrl + 1` raw bytes follow); a control
//! byte `0x20` and above starts a back-reference, whose length and
//! 13-bit offset are split across the control byte and one or two
//! trailing bytes. A decoder built against that token shape can read
//! either encoder's output; this one does not try to match the reference
//! encoder's exact match-selection heuristics, only its bitstream shape.

const HASH_BITS: u32 = 13;
const HASH_SIZE: usize = 1 << HASH_BITS;
const MAX_OFFSET: usize = 1 << HASH_BITS;
const MAX_LITERAL: usize = 32;
const MAX_MATCH: usize = 264; // 2 + (7 + 255), the largest length the token shape can hold.
const MIN_MATCH: usize = 3;

/// RDB never bothers compressing strings shorter than this; below this
/// length the two-byte-minimum backref overhead can't pay for itself.
pub const MIN_COMPRESS_LEN: usize = 21;

fn hash3(b0: u8, b1: u8, b2: u8) -> usize {
    let h = ((b0 as u32) << 16) | ((b1 as u32) << 8) | (b2 as u32);
    ((h.wrapping_mul(2_654_435_761)) >> (32 - HASH_BITS)) as usize & (HASH_SIZE - 1)
}

/// Compresses `input`, returning `None` if the compressed form would not be
/// smaller (callers fall back to storing the literal bytes uncompressed).
pub fn compress(input: &[u8]) -> Option<Vec<u8>> {
    if input.len() < MIN_COMPRESS_LEN {
        return None;
    }
    let mut out = Vec::with_capacity(input.len());
    let mut table = vec![-1i64; HASH_SIZE];
    let mut literal_start = 0usize;
    let mut i = 0usize;
    let n = input.len();

    let flush_literal = |out: &mut Vec<u8>, input: &[u8], start: usize, end: usize| {
        let mut pos = start;
        while pos < end {
            let chunk_len = (end - pos).min(MAX_LITERAL);
            out.push((chunk_len - 1) as u8);
            out.extend_from_slice(&input[pos..pos + chunk_len]);
            pos += chunk_len;
        }
    };

    while i < n {
        if i + MIN_MATCH > n {
            i += 1;
            continue;
        }
        let h = hash3(input[i], input[i + 1], input[i + 2]);
        let candidate = table[h];
        table[h] = i as i64;

        if candidate >= 0 {
            let cand = candidate as usize;
            let offset = i - cand;
            if offset >= 1 && offset <= MAX_OFFSET {
                let max_len = (n - i).min(MAX_MATCH);
                let mut len = 0usize;
                while len < max_len && input[cand + len] == input[i + len] {
                    len += 1;
                }
                if len >= MIN_MATCH {
                    flush_literal(&mut out, input, literal_start, i);
                    let stored_len = len - 2; // decoder adds 2 back
                    let off = offset - 1; // decoder adds 1 back
                    if stored_len < 7 {
                        out.push(((stored_len as u8) << 5) | ((off >> 8) as u8));
                    } else {
                        out.push((7u8 << 5) | ((off >> 8) as u8));
                        out.push((stored_len - 7) as u8);
                    }
                    out.push((off & 0xff) as u8);
                    i += len;
                    literal_start = i;
                    continue;
                }
            }
        }
        i += 1;
    }
    flush_literal(&mut out, input, literal_start, n);

    if out.len() < input.len() {
        Some(out)
    } else {
        None
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("truncated lzf stream")]
pub struct LzfTruncated;

/// Decompresses an LZF token stream into exactly `expected_len` bytes.
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>, LzfTruncated> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0usize;
    while i < input.len() {
        let ctrl = input[i] as usize;
        i += 1;
        if ctrl < 32 {
            let len = ctrl + 1;
            let end = i.checked_add(len).ok_or(LzfTruncated)?;
            let src = input.get(i..end).ok_or(LzfTruncated)?;
            out.extend_from_slice(src);
            i = end;
        } else {
            let mut len = ctrl >> 5;
            let off_hi = ctrl & 0x1f;
            if len == 7 {
                len += *input.get(i).ok_or(LzfTruncated)? as usize;
                i += 1;
            }
            let off_lo = *input.get(i).ok_or(LzfTruncated)? as usize;
            i += 1;
            let offset = (off_hi << 8 | off_lo) + 1;
            let total = len + 2;
            if offset > out.len() {
                return Err(LzfTruncated);
            }
            let mut src = out.len() - offset;
            for _ in 0..total {
                let byte = out[src];
                out.push(byte);
                src += 1;
            }
        }
    }
    if out.len() != expected_len {
        return Err(LzfTruncated);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_never_compresses() {
        assert_eq!(compress(b"short"), None);
    }

    #[test]
    fn repetitive_input_compresses() {
        let data = vec![b'a'; 1000];
        let compressed = compress(&data).expect("should compress");
        assert!(compressed.len() < data.len());
        let restored = decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn mixed_literal_and_match_roundtrips() {
        let mut data = Vec::new();
        for i in 0..500u32 {
            data.push((i % 7) as u8);
        }
        data.extend_from_slice(b"the quick brown fox the quick brown fox the quick brown fox");
        if let Some(compressed) = compress(&data) {
            let restored = decompress(&compressed, data.len()).unwrap();
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let data = vec![b'x'; 1000];
        let compressed = compress(&data).unwrap();
        let truncated = &compressed[..compressed.len() - 2];
        assert!(decompress(truncated, data.len()).is_err());
    }

    #[test]
    fn incompressible_random_like_data_falls_back() {
        let data: Vec<u8> = (0..50u32).map(|i| ((i * 97) % 251) as u8).collect();
        if let Some(compressed) = compress(&data) {
            let restored = decompress(&compressed, data.len()).unwrap();
            assert_eq!(restored, data);
        }
    }
}
