use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::chunk_id::ChunkId;
use crate::chunk_store::{write_chunk, ChunkCodec, MAX_CHUNK_BYTES};
use crate::manifest::{BuildManifest, ChunkPart, FileManifest};

pub const MANIFEST_FILENAME: &str = "manifest.json";

pub struct PackagerConfig {
    pub app_name: String,
    pub version_string: String,
    pub chunk_size: usize,
    pub codec: ChunkCodec,
    pub zstd_level: i32,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            version_string: String::new(),
            chunk_size: 1 << 20,
            codec: ChunkCodec::Raw,
            zstd_level: 3,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

enum Found {
    Regular { path: PathBuf, rel: String, executable: bool },
    Symlink { rel: String, target: String },
}

impl Found {
    fn rel(&self) -> &str {
        match self {
            Found::Regular { rel, .. } | Found::Symlink { rel, .. } => rel,
        }
    }
}

fn glob_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        b.add(Glob::new(p).with_context(|| format!("bad glob {p:?}"))?);
    }
    Ok(Some(b.build()?))
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

pub struct Packager;

impl Packager {
    /// Chunks every file under `root` into `store` and writes the build manifest there.
    pub fn package(root: &Path, store: &Path, cfg: &PackagerConfig) -> Result<BuildManifest> {
        if cfg.chunk_size == 0 || cfg.chunk_size > MAX_CHUNK_BYTES {
            bail!("chunk size must be between 1 and {MAX_CHUNK_BYTES} bytes");
        }
        let include = glob_set(&cfg.include)?;
        let exclude = glob_set(&cfg.exclude)?;
        let store_abs = store.canonicalize().ok();

        // 1) Discover entries, never following links
        let mut found = Vec::new();
        for ent in walkdir::WalkDir::new(root).min_depth(1).follow_links(false) {
            let ent = ent?;
            let path = ent.path();
            if let (Some(s), Ok(p)) = (&store_abs, path.canonicalize()) {
                if p.starts_with(s) {
                    continue;
                }
            }
            let ft = ent.file_type();
            if ft.is_dir() {
                continue;
            }
            let Some(rel) = pathdiff::diff_paths(path, root) else {
                continue;
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if include.as_ref().is_some_and(|g| !g.is_match(&rel)) {
                continue;
            }
            if exclude.as_ref().is_some_and(|g| g.is_match(&rel)) {
                continue;
            }
            if ft.is_symlink() {
                let target =
                    std::fs::read_link(path).with_context(|| format!("read link {path:?}"))?;
                found.push(Found::Symlink { rel, target: target.to_string_lossy().into_owned() });
            } else if ft.is_file() {
                let executable = is_executable(&ent.metadata()?);
                found.push(Found::Regular { path: path.to_path_buf(), rel, executable });
            }
        }
        found.sort_by(|a, b| a.rel().cmp(b.rel()));

        // 2) Chunk, hash and store in parallel; each chunk id is written once
        std::fs::create_dir_all(store).with_context(|| format!("create dir {:?}", store))?;
        let claimed: Mutex<HashSet<ChunkId>> = Mutex::new(HashSet::new());
        let files: Vec<FileManifest> = found
            .par_iter()
            .map(|f| match f {
                Found::Symlink { rel, target } => Ok(FileManifest {
                    filename: rel.clone(),
                    size: 0,
                    hash_hex: blake3::hash(&[]).to_hex().to_string(),
                    chunk_parts: Vec::new(),
                    symlink_target: Some(target.clone()),
                    executable: false,
                }),
                Found::Regular { path, rel, executable } => {
                    let mut fe = chunk_file(path, store, cfg, &claimed)?;
                    fe.filename = rel.clone();
                    fe.executable = *executable;
                    Ok(fe)
                }
            })
            .collect::<Result<_>>()?;

        let chunks = claimed.lock().map(|c| c.len()).unwrap_or(0);
        let manifest =
            BuildManifest::new(&cfg.app_name, &cfg.version_string, cfg.chunk_size, files);
        manifest.validate()?;
        manifest.save(&store.join(MANIFEST_FILENAME))?;
        info!(files = manifest.files().len(), chunks, "packaged {:?}", root);
        Ok(manifest)
    }
}

fn chunk_file(
    path: &Path,
    store: &Path,
    cfg: &PackagerConfig,
    claimed: &Mutex<HashSet<ChunkId>>,
) -> Result<FileManifest> {
    let mut f = File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; cfg.chunk_size];
    let mut parts = Vec::new();
    let mut size = 0u64;
    loop {
        let n = read_full(&mut f, &mut buf)?;
        if n == 0 {
            break;
        }
        let data = &buf[..n];
        hasher.update(data);
        let id = ChunkId::of(data);
        let fresh = claimed.lock().map(|mut c| c.insert(id)).unwrap_or(true);
        if fresh {
            write_chunk(store, data, cfg.codec, cfg.zstd_level)
                .with_context(|| format!("store chunk of {:?}", path))?;
        }
        parts.push(ChunkPart { chunk_id: id, offset: 0, size: n as u32 });
        size += n as u64;
    }
    debug!(file = ?path, size, parts = parts.len(), "chunked");
    Ok(FileManifest {
        filename: String::new(),
        size,
        hash_hex: hasher.finalize().to_hex().to_string(),
        chunk_parts: parts,
        symlink_target: None,
        executable: false,
    })
}

/// Fills `buf` unless EOF comes first.
fn read_full(f: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match f.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
