use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::OAuthState;

#[derive(Debug, Error)]
pub enum TokenCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("token cache is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// OAuth state kept as a JSON file next to the library database.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn load(&self) -> Result<Option<OAuthState>, TokenCacheError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes through a sibling temp file so a crash never leaves half a token.
    pub async fn save(&self, state: &OAuthState) -> Result<(), TokenCacheError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload).await?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Returns whether a cache file was removed.
    pub async fn delete(&self) -> Result<bool, TokenCacheError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Owner-only access; no-op where the platform has no mode bits.
#[cfg(unix)]
pub(crate) async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
pub(crate) async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
