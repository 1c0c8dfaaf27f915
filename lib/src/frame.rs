//! Chunked zlib payload framing.
//!
//! Payloads are split into blocks, each prefixed with big-endian
//! uncompressed and compressed sizes, deflated individually and glued
//! back together. Blocks are sometimes stored raw with no clear
//! indicator, so decoding is best-effort: a block that fails to inflate
//! is passed through verbatim.

use std::io::{Cursor, Read};
use std::path::Path;

use binrw::BinReaderExt;
use flate2::read::ZlibDecoder;

use crate::error::FrostpackError;

/// Leading bytes of a zlib deflate stream, probed when the block sizes
/// are equal and give no verdict.
const ZLIB_MAGIC: [u8; 2] = [0x78, 0xDA];

/// Decode `size` bytes of framed blocks from `reader`. `src` only labels
/// diagnostics.
pub fn decode_stream(
    mut reader: impl Read,
    size: u64,
    src: &Path,
) -> Result<Vec<u8>, FrostpackError> {
    let mut out = Vec::new();
    let mut consumed: u64 = 0;
    while consumed + 8 < size {
        let mut sizes = [0u8; 8];
        reader
            .read_exact(&mut sizes)
            .map_err(|e| FrostpackError::Io("Couldn't read frame block sizes".into(), e))?;
        let mut cur = Cursor::new(sizes);
        let uncompressed_size: u32 = cur.read_be().map_err(|e| {
            FrostpackError::BinRW("Couldn't decode frame block sizes".into(), e)
        })?;
        let compressed_size: u32 = cur.read_be().map_err(|e| {
            FrostpackError::BinRW("Couldn't decode frame block sizes".into(), e)
        })?;
        consumed += 8;

        let mut block = vec![0u8; compressed_size as usize];
        reader
            .read_exact(&mut block)
            .map_err(|e| FrostpackError::Io("Couldn't read frame block".into(), e))?;
        consumed += u64::from(compressed_size);

        if compressed_size != uncompressed_size || block.starts_with(&ZLIB_MAGIC) {
            out.extend(inflate_or_raw(block, src));
        } else {
            out.extend(block);
        }
    }
    Ok(out)
}

/// Decode an inline (idata) payload.
pub fn decode_bytes(data: &[u8], src: &Path) -> Result<Vec<u8>, FrostpackError> {
    decode_stream(data, data.len() as u64, src)
}

fn inflate_or_raw(block: Vec<u8>, src: &Path) -> Vec<u8> {
    let mut inflated = Vec::new();
    match ZlibDecoder::new(block.as_slice()).read_to_end(&mut inflated) {
        Ok(_) => inflated,
        Err(e) => {
            log::warn!(
                "Inflate failed in '{}' ({}); keeping {} raw bytes",
                src.display(),
                e,
                block.len()
            );
            block
        }
    }
}
