use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::chunk_id::ChunkId;
use crate::chunk_store;
use crate::reference_tracker::ChunkReferenceTracker;

/// Supplies decoded chunk bytes by content id.
///
/// `get` may block while data is fetched or decoded. `None` means the chunk
/// cannot be obtained; retrying is the source's own business.
pub trait ChunkSource: Send + Sync {
    fn get(&self, id: &ChunkId) -> Option<Arc<[u8]>>;
}

/// Chunks held in memory, keyed by id. Contents are not checked against the id.
#[derive(Default)]
pub struct MemoryChunkSource {
    chunks: Mutex<HashMap<ChunkId, Arc<[u8]>>>,
}

impl MemoryChunkSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `data` under its own content id.
    pub fn add(&self, data: &[u8]) -> ChunkId {
        let id = ChunkId::of(data);
        self.insert(id, data);
        id
    }

    pub fn insert(&self, id: ChunkId, data: &[u8]) {
        self.chunks.lock().unwrap_or_else(|p| p.into_inner()).insert(id, Arc::from(data));
    }

    pub fn remove(&self, id: &ChunkId) {
        self.chunks.lock().unwrap_or_else(|p| p.into_inner()).remove(id);
    }
}

impl ChunkSource for MemoryChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<[u8]>> {
        self.chunks.lock().unwrap_or_else(|p| p.into_inner()).get(id).cloned()
    }
}

/// Reads chunks from an on-disk store and keeps a bounded in-memory cache.
///
/// Cached chunks whose tracker count dropped to zero are evicted first; after
/// that the chunk with the fewest outstanding references goes.
pub struct StoreChunkSource {
    store: PathBuf,
    tracker: Arc<ChunkReferenceTracker>,
    capacity: usize,
    cache: Mutex<HashMap<ChunkId, Arc<[u8]>>>,
}

impl StoreChunkSource {
    pub fn new(store: &Path, tracker: Arc<ChunkReferenceTracker>, capacity: usize) -> Self {
        Self {
            store: store.to_path_buf(),
            tracker,
            capacity: capacity.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_cached(&self, id: &ChunkId) -> bool {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).contains_key(id)
    }

    fn evict(&self, cache: &mut HashMap<ChunkId, Arc<[u8]>>) {
        cache.retain(|id, _| !self.tracker.is_exhausted(id));
        while cache.len() >= self.capacity {
            let victim = cache.keys().min_by_key(|id| self.tracker.reference_count(id)).copied();
            match victim {
                Some(id) => {
                    debug!(chunk = %id, "evicting cached chunk");
                    cache.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl ChunkSource for StoreChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<[u8]>> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(data) = cache.get(id) {
                return Some(data.clone());
            }
            self.evict(&mut cache);
        }
        match chunk_store::read_chunk(&self.store, id) {
            Ok(data) => {
                let data: Arc<[u8]> = Arc::from(data);
                let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
                self.evict(&mut cache);
                cache.insert(*id, data.clone());
                Some(data)
            }
            Err(e) => {
                warn!(chunk = %id, error = %e, "chunk load failed");
                None
            }
        }
    }
}

/// Asks each source in turn and returns the first hit.
pub struct ChainedChunkSource {
    sources: Vec<Arc<dyn ChunkSource>>,
}

impl ChainedChunkSource {
    pub fn new(sources: Vec<Arc<dyn ChunkSource>>) -> Self {
        Self { sources }
    }
}

impl ChunkSource for ChainedChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<[u8]>> {
        self.sources.iter().find_map(|s| s.get(id))
    }
}
