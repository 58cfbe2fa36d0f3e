//! On-disk chunk store: one file per chunk under `<store>/chunks/<xx>/<hex>.chunk`.
//!
//! File layout: magic (8) + header length (u32 LE) + bincode [`ChunkHeader`] + payload.
//! The payload is stored raw or zstd-compressed; its CRC32 is kept in the header and
//! the decoded bytes must hash back to the chunk id.

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::chunk_id::ChunkId;

const CHUNK_MAGIC: &[u8; 8] = b"CPCHUNK1";
const HEADER_VERSION: u32 = 1;
/// Upper bound for a decoded chunk; guards decompression of hostile input.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkCodec {
    Raw = 0,
    Zstd = 1,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChunkHeader {
    pub version: u32,
    pub codec: u32,
    pub raw_len: u32,
    pub stored_len: u32,
    pub crc32: u32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk {0} not found in store")]
    NotFound(ChunkId),
    #[error("chunk {id}: {reason}")]
    Corrupt { id: ChunkId, reason: String },
    #[error("chunk {id}: bad header: {source}")]
    Header {
        id: ChunkId,
        #[source]
        source: bincode::Error,
    },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

pub fn chunk_path(store: &Path, id: &ChunkId) -> PathBuf {
    store.join("chunks").join(id.shard_prefix()).join(format!("{}.chunk", id.to_hex()))
}

pub fn has_chunk(store: &Path, id: &ChunkId) -> bool {
    chunk_path(store, id).is_file()
}

/// Writes `data` as chunk `ChunkId::of(data)`. Existing chunks are left alone.
pub fn write_chunk(
    store: &Path,
    data: &[u8],
    codec: ChunkCodec,
    level: i32,
) -> Result<ChunkId, StoreError> {
    let id = ChunkId::of(data);
    let path = chunk_path(store, &id);
    if path.is_file() {
        return Ok(id);
    }
    let dir = path.parent().unwrap_or(store);
    fs::create_dir_all(dir).map_err(io_err(dir))?;

    let stored = match codec {
        ChunkCodec::Raw => data.to_vec(),
        ChunkCodec::Zstd => zstd::stream::encode_all(data, level).map_err(io_err(&path))?,
    };
    let mut crc = Crc32::new();
    crc.update(&stored);
    let header = ChunkHeader {
        version: HEADER_VERSION,
        codec: codec as u32,
        raw_len: data.len() as u32,
        stored_len: stored.len() as u32,
        crc32: crc.finalize(),
    };
    let hdr = bincode::serialize(&header).map_err(|source| StoreError::Header { id, source })?;

    // Write beside the target and rename so readers never see a torn chunk.
    let tmp = path.with_extension("chunk.tmp");
    let mut f = File::create(&tmp).map_err(io_err(&tmp))?;
    f.write_all(CHUNK_MAGIC).map_err(io_err(&tmp))?;
    f.write_all(&(hdr.len() as u32).to_le_bytes()).map_err(io_err(&tmp))?;
    f.write_all(&hdr).map_err(io_err(&tmp))?;
    f.write_all(&stored).map_err(io_err(&tmp))?;
    f.sync_all().map_err(io_err(&tmp))?;
    drop(f);
    fs::rename(&tmp, &path).map_err(io_err(&path))?;
    Ok(id)
}

/// Loads, checks and decodes one chunk.
pub fn read_chunk(store: &Path, id: &ChunkId) -> Result<Vec<u8>, StoreError> {
    let path = chunk_path(store, id);
    let f = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(*id))
        }
        Err(e) => return Err(StoreError::Io { path, source: e }),
    };
    let mmap = unsafe { Mmap::map(&f) }.map_err(io_err(&path))?;
    decode_chunk(id, &mmap)
}

pub fn decode_chunk(id: &ChunkId, buf: &[u8]) -> Result<Vec<u8>, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt { id: *id, reason: reason.to_string() };
    if buf.len() < CHUNK_MAGIC.len() + 4 || &buf[..CHUNK_MAGIC.len()] != CHUNK_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut len4 = [0u8; 4];
    len4.copy_from_slice(&buf[8..12]);
    let hdr_len = u32::from_le_bytes(len4) as usize;
    let hdr_end = 12usize.checked_add(hdr_len).filter(|&e| e <= buf.len());
    let Some(hdr_end) = hdr_end else {
        return Err(corrupt("truncated header"));
    };
    let header: ChunkHeader = bincode::deserialize(&buf[12..hdr_end])
        .map_err(|source| StoreError::Header { id: *id, source })?;
    if header.version != HEADER_VERSION {
        return Err(corrupt(&format!("unsupported header version {}", header.version)));
    }
    let payload = &buf[hdr_end..];
    if payload.len() != header.stored_len as usize {
        return Err(corrupt("payload length mismatch"));
    }
    let mut crc = Crc32::new();
    crc.update(payload);
    if crc.finalize() != header.crc32 {
        return Err(corrupt("CRC mismatch"));
    }
    if header.raw_len as usize > MAX_CHUNK_BYTES {
        return Err(corrupt("chunk too large"));
    }
    let data = match header.codec {
        0 => payload.to_vec(),
        1 => {
            let mut out = Vec::with_capacity(header.raw_len as usize);
            zstd::stream::copy_decode(payload, &mut out)
                .map_err(|e| corrupt(&format!("zstd: {e}")))?;
            out
        }
        other => return Err(corrupt(&format!("unknown codec {other}"))),
    };
    if data.len() != header.raw_len as usize {
        return Err(corrupt("decoded length mismatch"));
    }
    if ChunkId::of(&data) != *id {
        return Err(corrupt("content hash mismatch"));
    }
    Ok(data)
}
