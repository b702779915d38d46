//! Artifact references - the files an analyzer reads and writes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::id::ArtifactId;

/// Immutable reference to a file under analysis.
///
/// The reference never carries the bytes themselves; an artifact store
/// resolves it to readable content. `sha256` and `size` let the store detect
/// that the file changed after the reference was taken.
///
/// In JSON, `id` and `sha256` may be omitted: a fresh id is assigned and the
/// hash is taken by the artifact store when the reference is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    #[serde(default)]
    id: ArtifactId,
    name: String,
    path: PathBuf,
    size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    sha256: String,
}

impl ArtifactRef {
    /// Build a reference from already known parts.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        size: u64,
        sha256: impl Into<String>,
    ) -> Self {
        Self {
            id: ArtifactId::new(),
            name: name.into(),
            path: path.into(),
            size,
            sha256: sha256.into(),
        }
    }

    /// Build a reference to an existing file, hashing its contents.
    ///
    /// The display name defaults to the file name component of `path`.
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self::new(name, path, size, hex::encode(hasher.finalize())))
    }

    /// Build a reference for bytes that were just written to `path`.
    pub fn for_bytes(name: impl Into<String>, path: impl Into<PathBuf>, data: &[u8]) -> Self {
        Self::new(name, path, data.len() as u64, content_hash(data))
    }

    /// Artifact identifier.
    pub fn id(&self) -> ArtifactId {
        self.id
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of the bytes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes at the time the reference was created.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hex encoded SHA-256 of the content, empty when not known yet.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Whether the content hash is known.
    pub fn has_hash(&self) -> bool {
        !self.sha256.is_empty()
    }

    /// Same reference with the content hash filled in.
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = sha256.into();
        self
    }
}

/// Hex encoded SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// An output artifact produced by an analyzer but not yet committed.
///
/// Only the engine turns pending artifacts into stored [`ArtifactRef`]s, and
/// only once the run that produced them finished successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingArtifact {
    /// File name for the stored artifact
    pub name: String,

    /// Full content
    pub data: Vec<u8>,
}

impl PendingArtifact {
    /// Create a pending artifact.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}
