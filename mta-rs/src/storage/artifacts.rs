//! Content-addressed storage for binary payloads the decoder cannot render

use crate::error::{MailError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const ARTIFACT_SCHEME: &str = "artifact:";

pub struct ArtifactStore {
    base_path: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Store `data` under its SHA-256 and return the `artifact:<hex>` reference
    ///
    /// Storing identical content twice writes it once.
    pub async fn put(&self, data: &[u8]) -> Result<String> {
        let digest = format!("{:x}", Sha256::digest(data));
        let path = self.base_path.join(&digest);

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Artifact {} already stored", digest);
            return Ok(format!("{}{}", ARTIFACT_SCHEME, digest));
        }

        fs::create_dir_all(&self.base_path).await.map_err(|e| {
            MailError::Storage(format!(
                "Failed to create directory {:?}: {}",
                self.base_path, e
            ))
        })?;

        let tmp_path = self.base_path.join(format!("{}.tmp", digest));
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Stored artifact {} ({} bytes)", digest, data.len());
        Ok(format!("{}{}", ARTIFACT_SCHEME, digest))
    }

    /// Read back an artifact by reference (`artifact:<hex>`) or bare digest
    pub async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        let digest = reference.strip_prefix(ARTIFACT_SCHEME).unwrap_or(reference);
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MailError::Parse(format!("Invalid artifact reference: {}", reference)));
        }

        match fs::read(self.base_path.join(digest)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MailError::NotFound(format!("Artifact {}", digest)))
            }
            Err(e) => Err(e.into()),
        }
    }
}
