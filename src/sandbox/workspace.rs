use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tempfile::TempDir;

// Work directories are private to the judge user
const WORK_DIR_PERMISSIONS: u32 = 0o700;

/// Resolves and creates the directory under which per-execution workspaces live
pub fn prepare_work_root(configured: Option<&Path>) -> anyhow::Result<PathBuf> {
    let root = match configured {
        Some(path) => path.to_path_buf(),
        None => {
            use directories::ProjectDirs;

            let proj_dirs = ProjectDirs::from("", "", "arena-judge")
                .ok_or_else(|| anyhow!("Unable to find user directory"))?;
            proj_dirs.cache_dir().join("work")
        }
    };

    fs::create_dir_all(&root)?;
    fs::set_permissions(&root, fs::Permissions::from_mode(WORK_DIR_PERMISSIONS))?;
    Ok(root)
}

/// Scoped working directory of one execution
///
/// Holds the sources, the driver, the test data and any compiled binary. The
/// directory and everything in it is removed when the workspace is dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    pub fn create(root: &Path) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("run-").tempdir_in(root)?;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(WORK_DIR_PERMISSIONS))?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn write(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        let path = self.join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => log::debug!("Workspace {} removed", self.path.display()),
            Err(e) => log::error!("Failed to remove workspace {}: {e}", self.path.display()),
        }
    }
}
