use std::io;
use std::path::Path;

/// Platform services the constructor needs beyond plain file I/O.
pub trait Platform: Send + Sync {
    /// Free bytes available to the current user on the volume holding `path`.
    fn available_space(&self, path: &Path) -> io::Result<u64>;
    fn create_symlink(&self, target: &str, link: &Path) -> io::Result<()>;
    fn set_executable(&self, path: &Path) -> io::Result<()>;
}

pub struct StdPlatform;

impl Platform for StdPlatform {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }

    #[cfg(unix)]
    fn create_symlink(&self, target: &str, link: &Path) -> io::Result<()> {
        match std::fs::symlink_metadata(link) {
            Ok(_) => std::fs::remove_file(link)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(not(unix))]
    fn create_symlink(&self, _target: &str, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks are not supported on this platform",
        ))
    }

    #[cfg(unix)]
    fn set_executable(&self, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        std::fs::set_permissions(path, perms)
    }

    #[cfg(not(unix))]
    fn set_executable(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}
