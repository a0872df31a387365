use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{IoContext, Result};

/// A per-job working directory, removed on drop.
///
/// Lives next to the outputs (not in the system temp dir) so results can be renamed into
/// place without crossing filesystems.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new_in(base: &Path) -> Result<Self> {
        let path = base.join(format!(".scratch-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&path).at(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_drop() {
        let base = std::env::temp_dir();
        let kept;
        {
            let scratch = ScratchDir::new_in(&base).unwrap();
            fs::write(scratch.join("a.obj"), b"v 0 0 0\n").unwrap();
            assert!(scratch.path().is_dir());
            kept = scratch.path().to_path_buf();
        }
        assert!(!kept.exists());
    }

    #[test]
    fn distinct_paths() {
        let base = std::env::temp_dir();
        let a = ScratchDir::new_in(&base).unwrap();
        let b = ScratchDir::new_in(&base).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
