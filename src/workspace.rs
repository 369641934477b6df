//! Ephemeral execution directories.

use crate::error::ExecError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory holding one execution's source and build artifacts.
///
/// Server-created workspaces are removed on [`Workspace::release`] or, if the
/// session is dropped mid-flight, when the value is dropped. Caller-supplied
/// directories are never removed.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    owned: bool,
    released: bool,
}

impl Workspace {
    /// Create a uniquely named directory under `root`.
    pub async fn create(root: &Path) -> Result<Self, ExecError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(ExecError::Workspace)?;
        let path = root.join(format!("ws-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir(&path)
            .await
            .map_err(ExecError::Workspace)?;
        let workspace = Self::owned(path).canonical().await?;
        info!(workspace = %workspace.path.display(), "Created workspace");
        Ok(workspace)
    }

    fn owned(path: PathBuf) -> Self {
        Self {
            path,
            owned: true,
            released: false,
        }
    }

    /// Resolve to an absolute path so it can be scrubbed from process output.
    /// On failure the value is dropped, removing a directory it owns.
    async fn canonical(mut self) -> Result<Self, ExecError> {
        self.path = tokio::fs::canonicalize(&self.path)
            .await
            .map_err(ExecError::Workspace)?;
        Ok(self)
    }

    /// Adopt a caller-supplied directory. Nothing is touched if it is absent.
    pub async fn adopt(dir: &Path) -> Result<Self, ExecError> {
        match tokio::fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(ExecError::MissingCustomDir(dir.to_path_buf())),
        }
        let path = tokio::fs::canonicalize(dir)
            .await
            .map_err(ExecError::Workspace)?;
        debug!(workspace = %path.display(), "Using caller-supplied workspace");
        Ok(Self {
            path,
            owned: false,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Write `code` verbatim as `file_name` inside the workspace.
    pub async fn write_source(&self, file_name: &str, code: &str) -> Result<PathBuf, ExecError> {
        let file = self.path.join(file_name);
        tokio::fs::write(&file, code.as_bytes())
            .await
            .map_err(ExecError::Workspace)?;
        Ok(file)
    }

    /// Remove the directory if the server created it. Never fails.
    pub async fn release(mut self) {
        if !self.take_ownership() {
            return;
        }
        let result = tokio::fs::remove_dir_all(&self.path).await;
        log_removal(&self.path, result);
    }

    /// Marks the workspace released; true if the directory is ours to remove.
    fn take_ownership(&mut self) -> bool {
        let owned = self.owned && !self.released;
        self.released = true;
        owned
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // Reached only when a session is cut short; runs synchronously.
        if self.take_ownership() {
            log_removal(&self.path, fs::remove_dir_all(&self.path));
        }
    }
}

fn log_removal(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => info!(workspace = %path.display(), "Removed workspace"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(workspace = %path.display(), error = %e, "Workspace cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn created_workspaces_are_unique_and_removed() {
        let root = TempDir::new().unwrap();
        let a = Workspace::create(root.path()).await.unwrap();
        let b = Workspace::create(root.path()).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.is_owned());

        let path = a.path().to_path_buf();
        assert!(path.is_dir());
        a.release().await;
        assert!(!path.exists());

        let path = b.path().to_path_buf();
        drop(b);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn source_is_written_byte_identical() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path()).await.unwrap();
        let code = "print('héllo')\n\ttabs\r\nand no trailing newline";
        let file = ws.write_source("script.py", code).await.unwrap();
        assert_eq!(file, ws.path().join("script.py"));
        assert_eq!(std::fs::read(&file).unwrap(), code.as_bytes());
    }

    #[tokio::test]
    async fn caller_supplied_directory_is_never_removed() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::adopt(dir.path()).await.unwrap();
        assert!(!ws.is_owned());
        ws.write_source("script.sh", "echo hi").await.unwrap();
        ws.release().await;
        assert!(dir.path().join("script.sh").exists());
    }

    #[tokio::test]
    async fn missing_custom_directory_is_reported_without_creating_it() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("absent");
        let err = Workspace::adopt(&missing).await.unwrap_err();
        assert!(matches!(err, ExecError::MissingCustomDir(_)));
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn release_tolerates_already_removed_directory() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path()).await.unwrap();
        std::fs::remove_dir_all(ws.path()).unwrap();
        ws.release().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_canonicalization_removes_the_new_entry() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("ws-loop");
        std::os::unix::fs::symlink("ws-loop", &path).unwrap();

        let err = Workspace::owned(path.clone()).canonical().await.unwrap_err();
        assert!(matches!(err, ExecError::Workspace(_)));
        assert!(std::fs::symlink_metadata(&path).is_err());
    }
}
