//! Filesystem artifact store.
//!
//! Inputs are read in place. Outputs are written below `root/<task-id>/`
//! through a temporary file that is linked into place, so a stored artifact
//! is either complete or absent. A stored file is never replaced: when the
//! name is taken the artifact gets a numbered name instead.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use triage_core::{ArtifactId, ArtifactRef, PendingArtifact, TaskId};

use super::{ArtifactStore, Result, StorageError};

const MAX_NAME_ATTEMPTS: usize = 1000;

/// Artifact store backed by a directory.
pub struct FsArtifactStore {
    root: PathBuf,
    verify_hash: bool,
}

impl FsArtifactStore {
    /// Create the store, creating `root` if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            verify_hash: true,
        })
    }

    /// Skip hashing inputs on resolve (size is still checked).
    pub fn without_hash_verification(mut self) -> Self {
        self.verify_hash = false;
        self
    }

    /// Output directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task: TaskId) -> PathBuf {
        self.root.join(task.to_string())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn resolve(&self, artifact: &ArtifactRef) -> Result<ArtifactRef> {
        let path = artifact.path();
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if !meta.is_file() {
            return Err(StorageError::Other(format!("{} is not a regular file", path.display())));
        }
        if meta.len() != artifact.size() {
            return Err(StorageError::Integrity(format!(
                "{}: expected {} bytes, found {}",
                path.display(),
                artifact.size(),
                meta.len()
            )));
        }

        if !artifact.has_hash() {
            let actual = hash_file(path).await?;
            debug!(path = %path.display(), sha256 = %actual, "hashed input without a recorded hash");
            return Ok(artifact.clone().with_sha256(actual));
        }

        if self.verify_hash {
            let actual = hash_file(path).await?;
            if !actual.eq_ignore_ascii_case(artifact.sha256()) {
                return Err(StorageError::Integrity(format!(
                    "{}: content hash changed",
                    path.display()
                )));
            }
        }

        Ok(artifact.clone())
    }

    async fn store(&self, task: TaskId, artifact: &PendingArtifact) -> Result<ArtifactRef> {
        let name = sanitize_name(&artifact.name);
        let dir = self.task_dir(task);
        fs::create_dir_all(&dir).await?;

        let partial_path = dir.join(format!(".{}.{}.partial", name, ArtifactId::new()));
        if let Err(e) = fs::write(&partial_path, &artifact.data).await {
            let _ = fs::remove_file(&partial_path).await;
            return Err(e.into());
        }
        let placed = place_unique(&partial_path, &dir, &name).await;
        if let Err(e) = fs::remove_file(&partial_path).await {
            warn!(path = %partial_path.display(), "failed to remove partial artifact: {}", e);
        }
        let (stored_name, final_path) = placed?;

        debug!(task_id = %task, path = %final_path.display(), "stored output artifact");
        Ok(ArtifactRef::for_bytes(stored_name, final_path, &artifact.data))
    }

    async fn discard(&self, artifact: &ArtifactRef) -> Result<()> {
        match fs::remove_file(artifact.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %artifact.path().display(), "failed to discard artifact: {}", e);
                Err(e.into())
            }
        }
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Link `partial` into `dir` as `name`, or as a numbered variant of `name`
/// when that file exists. Linking never replaces an existing file.
async fn place_unique(partial: &Path, dir: &Path, name: &str) -> Result<(String, PathBuf)> {
    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = if n == 0 { name.to_string() } else { numbered(name, n) };
        let path = dir.join(&candidate);
        match fs::hard_link(partial, &path).await {
            Ok(()) => return Ok((candidate, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(StorageError::Other(format!(
        "no free name for {} in {}",
        name,
        dir.display()
    )))
}

/// `evidence.bin.s_strings` -> `evidence-1.bin.s_strings`
fn numbered(name: &str, n: usize) -> String {
    match name.find('.') {
        Some(i) if i > 0 => format!("{}-{}{}", &name[..i], n, &name[i..]),
        _ => format!("{}-{}", name, n),
    }
}

/// Keep only the final path component so analyzers cannot write outside
/// their task directory.
fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base {
        "" | "." | ".." => "artifact".to_string(),
        other => other.to_string(),
    }
}
