use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

const READ_BUF: usize = 1 << 20;

/// BLAKE3 of a whole file, lowercase hex.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[derive(Clone)]
struct CachedHash {
    size: u64,
    modified: Option<SystemTime>,
    hash_hex: String,
}

/// File-hash memo keyed by path, invalidated when size or mtime change.
///
/// Lives as long as its owner; pass it to whatever needs repeated lookups.
#[derive(Default)]
pub struct HashCache {
    entries: Mutex<HashMap<PathBuf, CachedHash>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalidate(&self, path: &Path) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).remove(path);
    }

    pub fn hash(&self, path: &Path) -> io::Result<String> {
        let meta = std::fs::metadata(path)?;
        let size = meta.len();
        let modified = meta.modified().ok();
        if let Some(hit) = self.entries.lock().unwrap_or_else(|p| p.into_inner()).get(path) {
            if hit.size == size && hit.modified == modified {
                return Ok(hit.hash_hex.clone());
            }
        }
        let hash_hex = hash_file(path)?;
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.to_path_buf(), CachedHash { size, modified, hash_hex: hash_hex.clone() });
        Ok(hash_hex)
    }
}
