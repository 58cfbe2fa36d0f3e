//! Resume descriptor handling for a staging directory.
//!
//! The descriptor is a small text file holding the patch version tag of the build
//! being staged. Partial files are only trusted when that tag matches exactly.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::manifest::BuildManifest;

pub const RESUME_FILENAME: &str = "$resumeData";

pub struct ResumeData {
    staging_dir: PathBuf,
    resume_path: PathBuf,
    patch_version: String,
    previous_version: Option<String>,
    sizes: HashMap<String, u64>,
    files_started: HashSet<String>,
    files_completed: HashSet<String>,
}

impl ResumeData {
    pub fn new(staging_dir: &Path, manifest: &BuildManifest) -> Self {
        let resume_path = staging_dir.join(RESUME_FILENAME);
        let previous_version = fs::read_to_string(&resume_path).ok();
        let patch_version = manifest.patch_version();
        if let Some(prev) = &previous_version {
            debug!(previous = %prev, current = %patch_version, "found resume descriptor");
        }
        Self {
            staging_dir: staging_dir.to_path_buf(),
            resume_path,
            patch_version,
            previous_version,
            sizes: manifest.files().iter().map(|f| (f.filename.clone(), f.size)).collect(),
            files_started: HashSet::new(),
            files_completed: HashSet::new(),
        }
    }

    pub fn has_resume_data(&self) -> bool {
        self.previous_version.as_deref() == Some(self.patch_version.as_str())
    }

    pub fn has_incompatible_resume_data(&self) -> bool {
        self.previous_version.is_some() && !self.has_resume_data()
    }

    pub fn patch_version(&self) -> &str {
        &self.patch_version
    }

    /// Records whether `filename` looks started or complete on disk, judged by size only.
    pub fn check_file(&mut self, filename: &str) {
        if !self.has_resume_data() {
            return;
        }
        let Some(&declared) = self.sizes.get(filename) else {
            return;
        };
        let Ok(meta) = fs::metadata(self.staging_dir.join(filename)) else {
            return;
        };
        let len = meta.len();
        if len > 0 && len <= declared {
            self.files_started.insert(filename.to_string());
        }
        if len == declared {
            self.files_completed.insert(filename.to_string());
        }
    }

    pub fn is_started(&self, filename: &str) -> bool {
        self.files_started.contains(filename)
    }

    pub fn is_completed(&self, filename: &str) -> bool {
        self.files_completed.contains(filename)
    }

    /// Forget a file's resume state, e.g. after its staged copy was discarded.
    pub fn forget(&mut self, filename: &str) {
        self.files_started.remove(filename);
        self.files_completed.remove(filename);
    }

    /// Removes everything inside the staging directory, keeping the directory itself.
    pub fn wipe_staging(&mut self) -> Result<()> {
        info!(dir = ?self.staging_dir, "wiping staging area left by a different build");
        for ent in fs::read_dir(&self.staging_dir)
            .with_context(|| format!("read dir {:?}", self.staging_dir))?
        {
            let path = ent?.path();
            let meta = fs::symlink_metadata(&path)?;
            if meta.is_dir() {
                fs::remove_dir_all(&path).with_context(|| format!("remove {:?}", path))?;
            } else {
                fs::remove_file(&path).with_context(|| format!("remove {:?}", path))?;
            }
        }
        self.previous_version = None;
        self.files_started.clear();
        self.files_completed.clear();
        Ok(())
    }

    pub fn save_out(&self) -> Result<()> {
        fs::write(&self.resume_path, self.patch_version.as_bytes())
            .with_context(|| format!("write {:?}", self.resume_path))
    }

    /// Drops the descriptor once staging has been fully consumed.
    pub fn clear(staging_dir: &Path) -> Result<()> {
        let path = staging_dir.join(RESUME_FILENAME);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {:?}", path)),
        }
    }
}
