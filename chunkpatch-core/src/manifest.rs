use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::chunk_id::ChunkId;

/// A byte range inside a content-addressed chunk that contributes to one file.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPart {
    pub chunk_id: ChunkId,
    pub offset: u32,
    pub size: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileManifest {
    pub filename: String,
    pub size: u64,
    /// BLAKE3 of the whole file, lowercase hex.
    pub hash_hex: String,
    pub chunk_parts: Vec<ChunkPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    #[serde(default)]
    pub executable: bool,
}

impl FileManifest {
    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BuildManifest {
    pub app_name: String,
    pub version_string: String,
    pub created_utc: String,
    pub chunk_size: usize,
    files: Vec<FileManifest>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl BuildManifest {
    pub fn new(
        app_name: impl Into<String>,
        version_string: impl Into<String>,
        chunk_size: usize,
        files: Vec<FileManifest>,
    ) -> Self {
        let mut mf = Self {
            app_name: app_name.into(),
            version_string: version_string.into(),
            created_utc: chrono::Utc::now().to_rfc3339(),
            chunk_size,
            files,
            index: HashMap::new(),
        };
        mf.reindex();
        mf
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let mut mf: BuildManifest =
            serde_json::from_reader(BufReader::new(f)).context("read manifest.json")?;
        mf.reindex();
        mf.validate()?;
        Ok(mf)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let f = File::create(path).with_context(|| format!("create {:?}", path))?;
        serde_json::to_writer_pretty(f, self).context("write manifest.json")?;
        Ok(())
    }

    fn reindex(&mut self) {
        self.index =
            self.files.iter().enumerate().map(|(i, f)| (f.filename.clone(), i)).collect();
    }

    /// Version tag used to decide whether staged data belongs to this build.
    pub fn patch_version(&self) -> String {
        format!("{}{}", self.app_name, self.version_string)
    }

    pub fn files(&self) -> &[FileManifest] {
        &self.files
    }

    pub fn file(&self, filename: &str) -> Option<&FileManifest> {
        self.index.get(filename).map(|&i| &self.files[i])
    }

    pub fn file_list(&self) -> Vec<String> {
        self.files.iter().map(|f| f.filename.clone()).collect()
    }

    pub fn file_size(&self, filename: &str) -> u64 {
        self.file(filename).map(|f| f.size).unwrap_or(0)
    }

    pub fn total_size(&self, filenames: &[String]) -> u64 {
        filenames.iter().map(|f| self.file_size(f)).sum()
    }

    /// Structural checks: part sizes add up, symlinks carry no data, names are unique.
    pub fn validate(&self) -> Result<()> {
        if self.index.len() != self.files.len() {
            bail!("duplicate filenames in manifest");
        }
        for fe in &self.files {
            if fe.filename.is_empty() {
                bail!("empty filename in manifest");
            }
            let parts_total: u64 = fe.chunk_parts.iter().map(|p| p.size as u64).sum();
            if fe.is_symlink() {
                if fe.size != 0 || !fe.chunk_parts.is_empty() {
                    bail!("symlink {} must not carry data", fe.filename);
                }
            } else if parts_total != fe.size {
                bail!(
                    "{}: chunk parts cover {} bytes, declared size is {}",
                    fe.filename,
                    parts_total,
                    fe.size
                );
            }
        }
        Ok(())
    }
}
