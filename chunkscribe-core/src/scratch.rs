//! Process-unique temporary files under one scratch directory

use crate::error::Result;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

/// Owner of the scratch directory every temp artifact is created in.
///
/// Files are handed out as [`TempPath`]s: dropping one removes the file,
/// whichever way the owning scope is left.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
    prefix: String,
}

impl ScratchDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            prefix: format!("chunkscribe-{}-", std::process::id()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create an empty file named `chunkscribe-<pid>-<random><suffix>`
    pub fn create_temp(&self, suffix: &str) -> Result<TempPath> {
        std::fs::create_dir_all(&self.root)?;
        let file = tempfile::Builder::new()
            .prefix(&self.prefix)
            .suffix(suffix)
            .tempfile_in(&self.root)?;
        let path = file.into_temp_path();
        debug!(path = %path.display(), "created scratch file");
        Ok(path)
    }
}
