use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{anyhow, Context, Result};

const MAGIC: &[u8; 8] = b"RLDELTA1";
const FORMAT_VERSION: u8 = 1;

const OP_END: u8 = 0x00;
const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;

const BLOCK_SIZE: usize = 2048;

/// Applies a delta stream to `original`, writing the reconstructed target.
/// The stream is a magic + version header followed by tagged copy/insert
/// operations and a terminator.
pub fn decode_delta<R, D, W>(original: &mut R, delta: &mut D, target: &mut W) -> Result<()>
where
    R: Read + Seek,
    D: Read,
    W: Write,
{
    let mut header = [0u8; 9];
    delta
        .read_exact(&mut header)
        .context("delta stream is truncated before the header")?;
    if &header[..8] != MAGIC {
        return Err(anyhow!("delta stream has an invalid magic"));
    }
    if header[8] != FORMAT_VERSION {
        return Err(anyhow!("unsupported delta format version: {}", header[8]));
    }

    loop {
        let mut tag = [0u8; 1];
        delta
            .read_exact(&mut tag)
            .context("delta stream is truncated inside the operation list")?;
        match tag[0] {
            OP_END => return Ok(()),
            OP_COPY => {
                let offset = read_u64(delta)?;
                let length = read_u64(delta)?;
                original
                    .seek(SeekFrom::Start(offset))
                    .context("delta copy offset is outside the original")?;
                let mut remaining = length;
                let mut buffer = [0u8; 8192];
                while remaining > 0 {
                    let want = remaining.min(buffer.len() as u64) as usize;
                    original
                        .read_exact(&mut buffer[..want])
                        .context("delta copy range is outside the original")?;
                    target.write_all(&buffer[..want])?;
                    remaining -= want as u64;
                }
            }
            OP_INSERT => {
                let length = read_u32(delta)? as usize;
                let mut data = vec![0u8; length];
                delta
                    .read_exact(&mut data)
                    .context("delta insert payload is truncated")?;
                target.write_all(&data)?;
            }
            other => return Err(anyhow!("unknown delta operation tag: {other:#04x}")),
        }
    }
}

/// Produces a delta transforming `original` into `target`. Greedy
/// block-match encoder: target blocks found in the original become copy
/// operations (extended forward byte-wise), everything else is inserted
/// literally.
pub fn encode_delta(original: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + target.len() / 8);
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);

    let mut block_offsets: HashMap<&[u8], u64> = HashMap::new();
    let mut offset = 0usize;
    while offset + BLOCK_SIZE <= original.len() {
        block_offsets
            .entry(&original[offset..offset + BLOCK_SIZE])
            .or_insert(offset as u64);
        offset += BLOCK_SIZE;
    }

    let mut pending = Vec::new();
    let mut pos = 0usize;
    while pos < target.len() {
        let matched = if pos + BLOCK_SIZE <= target.len() {
            block_offsets
                .get(&target[pos..pos + BLOCK_SIZE])
                .copied()
                .map(|orig_offset| {
                    let mut length = BLOCK_SIZE;
                    while pos + length < target.len()
                        && (orig_offset as usize) + length < original.len()
                        && target[pos + length] == original[orig_offset as usize + length]
                    {
                        length += 1;
                    }
                    (orig_offset, length)
                })
        } else {
            None
        };

        match matched {
            Some((orig_offset, length)) => {
                flush_insert(&mut out, &mut pending);
                out.push(OP_COPY);
                out.extend_from_slice(&orig_offset.to_le_bytes());
                out.extend_from_slice(&(length as u64).to_le_bytes());
                pos += length;
            }
            None => {
                let take = BLOCK_SIZE.min(target.len() - pos);
                pending.extend_from_slice(&target[pos..pos + take]);
                pos += take;
            }
        }
    }

    flush_insert(&mut out, &mut pending);
    out.push(OP_END);
    out
}

fn flush_insert(out: &mut Vec<u8>, pending: &mut Vec<u8>) {
    if pending.is_empty() {
        return;
    }
    out.push(OP_INSERT);
    out.extend_from_slice(&(pending.len() as u32).to_le_bytes());
    out.extend_from_slice(pending);
    pending.clear();
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .context("delta stream is truncated inside an operation")?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .context("delta stream is truncated inside an operation")?;
    Ok(u64::from_le_bytes(buf))
}
