// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-disk worker layout.
//!
//! ```text
//! {worker_dir}/
//! ├── lib/                     shared shims, written once per extension type
//! │   ├── control.js
//! │   └── pgsql.js ...
//! └── workers/{uid}/
//!     ├── workerd.capnp        generated sandbox configuration
//!     └── src/                 inline entry script or extracted archive
//! ```

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use edgehost_agent_sdk::WorkerRecord;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{Error, Result};

/// File name of the generated sandbox configuration.
pub const CONFIG_FILE_NAME: &str = "workerd.capnp";
/// Directory under the root holding per-worker directories.
pub const WORKERS_DIR: &str = "workers";
/// Directory under a worker holding its code.
pub const CODE_DIR: &str = "src";
/// Directory under the root holding shared shims.
pub const LIB_DIR: &str = "lib";

/// Paths and file operations of the worker layout.
#[derive(Debug, Clone)]
pub struct WorkerArtifacts {
    root: PathBuf,
}

impl WorkerArtifacts {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Private directory of one worker; the runtime's working directory.
    pub fn worker_dir(&self, uid: &str) -> PathBuf {
        self.root.join(WORKERS_DIR).join(uid)
    }

    /// Code directory of one worker.
    pub fn code_dir(&self, uid: &str) -> PathBuf {
        self.worker_dir(uid).join(CODE_DIR)
    }

    /// Generated configuration file of one worker.
    pub fn config_path(&self, uid: &str) -> PathBuf {
        self.worker_dir(uid).join(CONFIG_FILE_NAME)
    }

    /// Shared shim file for an extension type.
    pub fn shim_path(&self, extension: &str) -> PathBuf {
        self.root.join(LIB_DIR).join(format!("{}.js", extension))
    }

    /// Write the worker's code: the inline entry, or the extracted archive.
    pub async fn write_code(&self, worker: &WorkerRecord, archive: Option<Vec<u8>>) -> Result<()> {
        let code_dir = self.code_dir(&worker.uid);
        tokio::fs::create_dir_all(&code_dir).await?;

        match archive {
            Some(bytes) => {
                let target = code_dir.clone();
                let count = tokio::task::spawn_blocking(move || extract_archive(&bytes, &target))
                    .await
                    .map_err(|e| Error::Other(format!("archive extraction panicked: {}", e)))??;
                debug!(worker_uid = %worker.uid, files = count, "Extracted worker archive");
            }
            None => {
                let entry = safe_relative(&worker.entry).ok_or_else(|| {
                    Error::InvalidRequest(format!("invalid entry file name: {}", worker.entry))
                })?;
                let path = code_dir.join(entry);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, worker.code.as_deref().unwrap_or_default()).await?;
            }
        }

        Ok(())
    }

    /// Write the generated configuration file.
    pub async fn write_config(&self, uid: &str, content: &str) -> Result<PathBuf> {
        let path = self.config_path(uid);
        tokio::fs::create_dir_all(self.worker_dir(uid)).await?;
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    /// Write a shared shim unless one is already present. Returns whether it was written.
    pub async fn write_shim_if_absent(&self, extension: &str, script: &str) -> Result<bool> {
        let path = self.shim_path(extension);
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::create_dir_all(self.root.join(LIB_DIR)).await?;
        tokio::fs::write(&path, script).await?;
        Ok(true)
    }

    /// Remove everything stored for a worker. A missing directory is not an error.
    pub async fn remove(&self, uid: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.worker_dir(uid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(worker_uid = %uid, error = %e, "Failed to remove worker directory");
                Err(e.into())
            }
        }
    }
}

/// Normalize a relative path, rejecting anything that could leave its base directory.
fn safe_relative(name: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn extract_archive(bytes: &[u8], target: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut written = 0;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let relative = safe_relative(&name)
            .ok_or_else(|| Error::InvalidRequest(format!("archive entry escapes code dir: {}", name)))?;
        let path = target.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&path)?;
            continue;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        std::fs::write(&path, contents)?;
        written += 1;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buffer);
            for (name, body) in entries {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buffer.into_inner()
    }

    fn worker(uid: &str) -> WorkerRecord {
        WorkerRecord {
            uid: uid.to_string(),
            entry: "entry.js".to_string(),
            code: Some("export default {}".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_layout_paths() {
        let artifacts = WorkerArtifacts::new("/data");
        assert_eq!(artifacts.worker_dir("w1"), PathBuf::from("/data/workers/w1"));
        assert_eq!(
            artifacts.config_path("w1"),
            PathBuf::from("/data/workers/w1/workerd.capnp")
        );
        assert_eq!(artifacts.shim_path("pgsql"), PathBuf::from("/data/lib/pgsql.js"));
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(safe_relative("a/./b.js"), Some(PathBuf::from("a/b.js")));
        assert_eq!(safe_relative("../etc/passwd"), None);
        assert_eq!(safe_relative("/etc/passwd"), None);
        assert_eq!(safe_relative(""), None);
    }

    #[tokio::test]
    async fn test_inline_code_written_to_entry() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = WorkerArtifacts::new(dir.path());

        artifacts.write_code(&worker("w1"), None).await.unwrap();

        let written = tokio::fs::read_to_string(artifacts.code_dir("w1").join("entry.js"))
            .await
            .unwrap();
        assert_eq!(written, "export default {}");
    }

    #[tokio::test]
    async fn test_archive_extracted_into_code_dir() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = WorkerArtifacts::new(dir.path());
        let archive = zip_of(&[("entry.js", "main"), ("lib/util.js", "util")]);

        artifacts
            .write_code(&worker("w1"), Some(archive))
            .await
            .unwrap();

        let code_dir = artifacts.code_dir("w1");
        assert_eq!(std::fs::read_to_string(code_dir.join("entry.js")).unwrap(), "main");
        assert_eq!(
            std::fs::read_to_string(code_dir.join("lib/util.js")).unwrap(),
            "util"
        );
    }

    #[tokio::test]
    async fn test_archive_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = WorkerArtifacts::new(dir.path());
        let archive = zip_of(&[("../../evil.js", "x")]);

        let err = artifacts
            .write_code(&worker("w1"), Some(archive))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(!dir.path().join("evil.js").exists());
    }

    #[tokio::test]
    async fn test_shim_written_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = WorkerArtifacts::new(dir.path());

        assert!(artifacts.write_shim_if_absent("kv", "v1").await.unwrap());
        assert!(!artifacts.write_shim_if_absent("kv", "v2").await.unwrap());
        assert_eq!(
            std::fs::read_to_string(artifacts.shim_path("kv")).unwrap(),
            "v1"
        );
    }

    #[tokio::test]
    async fn test_remove_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = WorkerArtifacts::new(dir.path());
        artifacts.remove("never-existed").await.unwrap();

        artifacts.write_code(&worker("w1"), None).await.unwrap();
        artifacts.remove("w1").await.unwrap();
        assert!(!artifacts.worker_dir("w1").exists());
    }
}
