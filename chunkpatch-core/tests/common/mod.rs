#![allow(dead_code)]

use chunkpatch_core::chunk_id::ChunkId;
use chunkpatch_core::chunk_source::{ChunkSource, MemoryChunkSource};
use chunkpatch_core::constructor::{ConstructorConfig, FileConstructor};
use chunkpatch_core::manifest::{BuildManifest, ChunkPart, FileManifest};
use chunkpatch_core::platform::{Platform, StdPlatform};
use chunkpatch_core::reference_tracker::ChunkReferenceTracker;
use chunkpatch_core::resume::RESUME_FILENAME;
use chunkpatch_core::stat::FileConstructorStat;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    fastrand::seed(seed);
    (0..len).map(|_| fastrand::u8(..)).collect()
}

pub fn file_entry(name: &str, data: &[u8], parts: Vec<ChunkPart>) -> FileManifest {
    FileManifest {
        filename: name.into(),
        size: data.len() as u64,
        hash_hex: blake3::hash(data).to_hex().to_string(),
        chunk_parts: parts,
        symlink_target: None,
        executable: false,
    }
}

pub fn link_entry(name: &str, target: &str) -> FileManifest {
    FileManifest {
        filename: name.into(),
        size: 0,
        hash_hex: String::new(),
        chunk_parts: vec![],
        symlink_target: Some(target.into()),
        executable: false,
    }
}

/// Build manifest plus in-memory chunks for a set of named contents.
pub struct Fixture {
    pub manifest: Arc<BuildManifest>,
    pub source: Arc<MemoryChunkSource>,
    pub contents: HashMap<String, Vec<u8>>,
}

impl Fixture {
    /// Splits every file into `chunk`-sized chunks, one part per chunk.
    pub fn split(files: &[(&str, Vec<u8>)], chunk: usize) -> Self {
        Self::split_versioned(files, chunk, "1")
    }

    pub fn split_versioned(files: &[(&str, Vec<u8>)], chunk: usize, version: &str) -> Self {
        let source = MemoryChunkSource::new();
        let mut entries = Vec::new();
        let mut contents = HashMap::new();
        for (name, data) in files {
            let parts = data
                .chunks(chunk)
                .map(|c| ChunkPart { chunk_id: source.add(c), offset: 0, size: c.len() as u32 })
                .collect();
            entries.push(file_entry(name, data, parts));
            contents.insert(name.to_string(), data.clone());
        }
        Self {
            manifest: Arc::new(BuildManifest::new("App", version, chunk, entries)),
            source: Arc::new(source),
            contents,
        }
    }

    pub fn files(&self) -> Vec<String> {
        self.manifest.file_list()
    }

    pub fn part_ids(&self, name: &str) -> Vec<ChunkId> {
        self.manifest.file(name).unwrap().chunk_parts.iter().map(|p| p.chunk_id).collect()
    }

    pub fn stage(&self, staging: &Path, name: &str, bytes: &[u8]) {
        let p = staging.join(name);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, bytes).unwrap();
    }

    pub fn write_descriptor(&self, staging: &Path) {
        std::fs::write(staging.join(RESUME_FILENAME), self.manifest.patch_version()).unwrap();
    }

    pub fn assert_staged(&self, staging: &Path, name: &str) {
        let got = std::fs::read(staging.join(name)).unwrap();
        assert_eq!(got.len(), self.contents[name].len(), "{name} length");
        assert!(got == self.contents[name], "{name} content differs");
    }
}

/// Counts calls to an inner source.
pub struct CountingSource {
    pub inner: Arc<dyn ChunkSource>,
    pub gets: AtomicUsize,
}

impl CountingSource {
    pub fn new(inner: Arc<dyn ChunkSource>) -> Arc<Self> {
        Arc::new(Self { inner, gets: AtomicUsize::new(0) })
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

impl ChunkSource for CountingSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<[u8]>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(id)
    }
}

/// Reports a fixed amount of free space; everything else is the real platform.
pub struct FixedSpace(pub u64);

impl Platform for FixedSpace {
    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }

    fn create_symlink(&self, target: &str, link: &Path) -> std::io::Result<()> {
        StdPlatform.create_symlink(target, link)
    }

    fn set_executable(&self, path: &Path) -> std::io::Result<()> {
        StdPlatform.set_executable(path)
    }
}

/// Refuses to create symlinks.
pub struct NoLinks;

impl Platform for NoLinks {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        StdPlatform.available_space(path)
    }

    fn create_symlink(&self, _target: &str, _link: &Path) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "links disabled"))
    }

    fn set_executable(&self, path: &Path) -> std::io::Result<()> {
        StdPlatform.set_executable(path)
    }
}

#[derive(Default)]
pub struct RecordingStat {
    pub events: Mutex<Vec<String>>,
}

impl RecordingStat {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, ev: String) {
        self.events.lock().unwrap().push(ev);
    }
}

impl FileConstructorStat for RecordingStat {
    fn on_total_required(&self, total_bytes: u64) {
        self.push(format!("total:{total_bytes}"));
    }
    fn on_resume_started(&self) {
        self.push("resume-start".into());
    }
    fn on_resume_completed(&self) {
        self.push("resume-end".into());
    }
    fn on_file_started(&self, filename: &str, _size: u64) {
        self.push(format!("start:{filename}"));
    }
    fn on_file_completed(&self, filename: &str, success: bool) {
        self.push(format!("done:{filename}:{success}"));
    }
}

/// Constructor over `files` with disk-space preflight off.
pub fn constructor(
    staging: &Path,
    manifest: &Arc<BuildManifest>,
    files: Vec<String>,
    source: Arc<dyn ChunkSource>,
) -> (FileConstructor, Arc<ChunkReferenceTracker>) {
    let tracker = Arc::new(ChunkReferenceTracker::new(manifest, &files));
    let mut cfg = ConstructorConfig::new(staging);
    cfg.preflight_disk_space = false;
    let fc = FileConstructor::new(cfg, manifest.clone(), files, source, tracker.clone());
    (fc, tracker)
}
