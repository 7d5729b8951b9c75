use std::path::{Path, PathBuf};

use tracing::warn;

/// Default base directory for host-side working files.
pub const DEFAULT_BASE_DIR: &str = "/tmp/codeserver";

/// Host directories the compile pipeline works in.
///
/// The compiled directory is bind-mounted read-only into compiled-language
/// sandboxes at its own host path, so an artifact's path means the same
/// thing on both sides of the mount.
#[derive(Debug, Clone)]
pub struct HostPaths {
    base_dir: PathBuf,
}

impl HostPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Sources awaiting compilation.
    pub fn code_files(&self) -> PathBuf {
        self.base_dir.join("code_files")
    }

    /// Build outputs, mounted into sandboxes.
    pub fn compiled_files(&self) -> PathBuf {
        self.base_dir.join("compiled")
    }

    /// Create both directories if missing.
    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.code_files()).await?;
        tokio::fs::create_dir_all(self.compiled_files()).await?;
        Ok(())
    }

    /// Delete everything under both directories (best-effort).
    pub async fn clear(&self) {
        for dir in [self.code_files(), self.compiled_files()] {
            clear_dir(&dir).await;
        }
    }
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::new(PathBuf::from(DEFAULT_BASE_DIR))
    }
}

async fn clear_dir(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let result = match entry.file_type().await {
            Ok(t) if t.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to remove working file");
        }
    }
}
