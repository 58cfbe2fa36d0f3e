use crate::hash_cache::HashCache;
use crate::manifest::{BuildManifest, FileManifest};
use crate::path_safety::staged_path;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub files_ok: u64,
    pub bad: Vec<String>,
    pub missing: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.bad.is_empty() && self.missing.is_empty()
    }
}

enum Outcome {
    Ok,
    Bad,
    Missing,
}

fn check(fe: &FileManifest, dir: &Path, cache: &HashCache) -> Outcome {
    let Ok(path) = staged_path(dir, &fe.filename) else {
        return Outcome::Bad;
    };
    if let Some(target) = &fe.symlink_target {
        return match std::fs::read_link(&path) {
            Ok(t) if t == Path::new(target) => Outcome::Ok,
            Ok(_) => Outcome::Bad,
            Err(_) if std::fs::symlink_metadata(&path).is_ok() => Outcome::Bad,
            Err(_) => Outcome::Missing,
        };
    }
    match std::fs::metadata(&path) {
        Err(_) => return Outcome::Missing,
        Ok(m) if m.len() != fe.size => return Outcome::Bad,
        Ok(_) => {}
    }
    match cache.hash(&path) {
        Ok(h) if h == fe.hash_hex => Outcome::Ok,
        Ok(_) => Outcome::Bad,
        Err(e) => {
            debug!(file = %fe.filename, "hash failed: {e}");
            Outcome::Bad
        }
    }
}

/// Re-hashes every manifest file found under `dir`.
pub fn verify(manifest: &BuildManifest, dir: &Path, cache: &HashCache) -> VerifyReport {
    let outcomes: Vec<(&FileManifest, Outcome)> =
        manifest.files().par_iter().map(|fe| (fe, check(fe, dir, cache))).collect();
    let mut report = VerifyReport::default();
    for (fe, outcome) in outcomes {
        match outcome {
            Outcome::Ok => report.files_ok += 1,
            Outcome::Bad => report.bad.push(fe.filename.clone()),
            Outcome::Missing => report.missing.push(fe.filename.clone()),
        }
    }
    report
}
