//! Filesystem artifact store.
//!
//! One raw scanner XML file per (chunk, address), laid out as
//! `<state_dir>/scans/<chunk_id>/<address>.xml`. Writes go through a
//! temporary sibling and a rename, so readers never observe a torn file.
//! A zero-length file is a real outcome meaning the scanner produced no
//! output; it is distinct from an absent file. The store never deletes
//! anything.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

/// One artifact yielded by [`ArtifactStore::iterate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub chunk_id: Uuid,
    pub address: String,
    pub bytes: Vec<u8>,
}

/// Content-addressed store of raw scan output.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    scans_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            scans_dir: state_dir.into().join("scans"),
        }
    }

    pub fn scans_dir(&self) -> &Path {
        &self.scans_dir
    }

    fn chunk_dir(&self, chunk_id: Uuid) -> PathBuf {
        self.scans_dir.join(chunk_id.to_string())
    }

    fn artifact_path(&self, chunk_id: Uuid, address: &str) -> PathBuf {
        self.chunk_dir(chunk_id).join(format!("{address}.xml"))
    }

    /// Atomically persists the artifact, creating directories on demand.
    pub async fn write(&self, chunk_id: Uuid, address: &str, bytes: &[u8]) -> io::Result<()> {
        let dir = self.chunk_dir(chunk_id);
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{address}.xml.tmp"));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, self.artifact_path(chunk_id, address)).await
    }

    /// Reads an artifact. `None` means it was never written; an empty
    /// vector means the scanner produced no output.
    pub async fn read(&self, chunk_id: Uuid, address: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.artifact_path(chunk_id, address)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// True when the artifact exists and is non-empty.
    pub async fn has_data(&self, chunk_id: Uuid, address: &str) -> bool {
        fs::metadata(self.artifact_path(chunk_id, address))
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    /// Collects every stored artifact for aggregation. Directories that
    /// are not chunk ids and files that are not artifacts are skipped.
    pub async fn iterate(&self) -> io::Result<Vec<ArtifactEntry>> {
        let mut entries = Vec::new();
        let mut chunk_dirs = match fs::read_dir(&self.scans_dir).await {
            Ok(dirs) => dirs,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err),
        };
        while let Some(dir) = chunk_dirs.next_entry().await? {
            let name = dir.file_name();
            let Ok(chunk_id) = name.to_string_lossy().parse::<Uuid>() else {
                continue;
            };
            let mut files = fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().into_owned();
                let Some(address) = name.strip_suffix(".xml") else {
                    continue;
                };
                let bytes = fs::read(file.path()).await?;
                entries.push(ArtifactEntry {
                    chunk_id,
                    address: address.to_string(),
                    bytes,
                });
            }
        }
        Ok(entries)
    }
}
