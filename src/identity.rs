//! Stable user identity
//!
//! All remote calls are namespaced by an opaque user id. The id is resolved
//! once, before any backend is built.

use crate::{CoachError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Hands out a stable opaque user identifier
pub trait IdentityProvider: Send + Sync {
    fn user_id(&self) -> &str;
}

/// Fixed id, for embedding hosts that already know the user
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    user_id: String,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Id stored in a small file; generated on first use.
#[derive(Debug, Clone)]
pub struct FileIdentity {
    path: PathBuf,
    user_id: String,
}

impl FileIdentity {
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).await?;
            let user_id = content.trim().to_string();
            if user_id.is_empty() {
                return Err(CoachError::Identity(format!(
                    "identity file {} is empty",
                    path.display()
                )));
            }
            debug!("Loaded user id from {}", path.display());
            return Ok(Self {
                path: path.to_path_buf(),
                user_id,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let user_id = format!("user_{}", uuid::Uuid::new_v4().simple());
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(user_id.as_bytes()).await?;
        file.flush().await?;

        info!("Created new user id at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            user_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityProvider for FileIdentity {
    fn user_id(&self) -> &str {
        &self.user_id
    }
}
