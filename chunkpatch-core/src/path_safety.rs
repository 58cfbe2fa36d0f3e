use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

/// Resolves manifest filename `rel` under `root`.
///
/// Rejects empty names, absolute paths, `..` and drive prefixes. Parent directories
/// that already exist below `root` must not be symlinks, so that writes cannot be
/// redirected outside the tree. The final component may be a symlink.
pub fn staged_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.is_empty() {
        bail!("empty path");
    }
    if rel_path.is_absolute() || rel.starts_with('/') || rel.starts_with('\\') {
        bail!("absolute paths are not allowed: {:?}", rel);
    }
    let comps: Vec<Component> = rel_path.components().collect();
    for comp in &comps {
        match comp {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => bail!("parent traversal not allowed: {:?}", rel),
            Component::RootDir | Component::Prefix(_) => {
                bail!("absolute paths are not allowed: {:?}", rel)
            }
        }
    }
    let mut cur = root.to_path_buf();
    for comp in comps.iter().take(comps.len().saturating_sub(1)) {
        cur = cur.join(comp);
        if let Ok(m) = std::fs::symlink_metadata(&cur) {
            if m.file_type().is_symlink() {
                bail!("symlink in path (not following): {:?}", cur);
            }
        }
    }
    Ok(root.join(rel_path))
}
