use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::chunk_id::ChunkId;
use crate::manifest::BuildManifest;

/// Outstanding chunk-part references for the files still to be built.
///
/// Every chunk-part of every listed file registers one reference. Each reference
/// is popped exactly once, whether its bytes were copied or the file was skipped.
/// A chunk whose count reaches zero may be evicted by whichever cache holds it.
pub struct ChunkReferenceTracker {
    counts: Mutex<HashMap<ChunkId, usize>>,
}

impl ChunkReferenceTracker {
    pub fn new(manifest: &BuildManifest, files: &[String]) -> Self {
        let mut counts: HashMap<ChunkId, usize> = HashMap::new();
        for name in files {
            if let Some(fe) = manifest.file(name) {
                for part in &fe.chunk_parts {
                    *counts.entry(part.chunk_id).or_default() += 1;
                }
            }
        }
        Self { counts: Mutex::new(counts) }
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<ChunkId, usize>> {
        self.counts.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Consumes one reference. False if `id` has none left.
    pub fn pop_reference(&self, id: &ChunkId) -> bool {
        let mut counts = self.counts();
        match counts.get_mut(id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn reference_count(&self, id: &ChunkId) -> usize {
        self.counts().get(id).copied().unwrap_or(0)
    }

    pub fn is_exhausted(&self, id: &ChunkId) -> bool {
        self.reference_count(id) == 0
    }

    pub fn total_references(&self) -> usize {
        self.counts().values().sum()
    }

    /// Chunks that still have at least one outstanding reference.
    pub fn referenced_chunks(&self) -> HashSet<ChunkId> {
        self.counts().iter().filter(|(_, &n)| n > 0).map(|(id, _)| *id).collect()
    }
}
