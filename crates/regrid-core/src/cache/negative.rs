//! Short-lived records of failed computations.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use super::key::CacheKey;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct NegativeEntry {
    pub key: CacheKey,
    pub message: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NegativeEntry {
    pub(crate) fn new(key: &CacheKey, message: &str, context: String, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::zero());
        Self {
            key: key.clone(),
            message: message.to_string(),
            context,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub(crate) fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Read a record whether or not it has expired; unreadable counts as absent.
    pub(crate) fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice::<Self>(&bytes).ok())
    }

    /// Read a live record; unreadable or expired records count as absent.
    pub(crate) fn load(path: &Path) -> Result<Option<Self>> {
        Ok(Self::read(path)?.filter(|entry| !entry.is_expired()))
    }

    pub(crate) fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub(crate) fn remove(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
