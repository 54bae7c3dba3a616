//! On-disk session vault: one JSON file per (domain, proxy-identity).
//!
//! Writes are atomic (temp file in the vault directory, then rename), so
//! a crash mid-write never leaves a torn session file. Boot reloads every
//! file and lets the pool drop entries the retirement rules already
//! condemn.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{PoolError, PoolResult, SessionKey};

/// Health of a vaulted session as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    Valid,
    Invalid,
    Expired,
    #[default]
    Unknown,
}

/// Persisted session state: the reusable browser identity plus the
/// metadata the trust computation reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub domain: String,
    pub proxy_identity: String,
    /// Cookie jar as captured from the browser (CDP cookie shape)
    pub cookies: Vec<serde_json::Value>,
    /// localStorage/sessionStorage snapshot
    pub storage_state: serde_json::Value,
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub created_at: i64,
    pub last_used: i64,
    /// Unix seconds of the most recent successful use
    pub last_success_at: Option<i64>,
    pub total_uses: u32,
    pub consecutive_failures: u32,
    pub captcha_count: u32,
    pub health: SessionHealth,
    pub expires_at: Option<i64>,
}

impl SessionRecord {
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey {
            domain: self.domain.clone(),
            proxy_identity: self.proxy_identity.clone(),
        }
    }
}

/// Directory of per-session JSON files.
#[derive(Debug, Clone)]
pub struct SessionVault {
    dir: PathBuf,
}

impl SessionVault {
    pub async fn open(dir: &Path) -> PoolResult<Self> {
        tokio::fs::create_dir_all(dir).await.map_err(PoolError::Io)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn file_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!(
            "{}__{}.json",
            sanitize_component(&key.domain),
            sanitize_component(&key.proxy_identity)
        ))
    }

    /// Write a session file atomically: temp file in the same directory,
    /// fsync, rename over the target.
    pub async fn save(&self, record: &SessionRecord) -> PoolResult<()> {
        let target = self.file_for(&record.key());
        let json = serde_json::to_vec_pretty(record).map_err(PoolError::Serialization)?;
        let dir = self.dir.clone();

        let temp = tokio::task::spawn_blocking(move || -> std::io::Result<tempfile::NamedTempFile> {
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            std::io::Write::write_all(&mut temp, &json)?;
            temp.as_file().sync_all()?;
            Ok(temp)
        })
        .await
        .map_err(|e| PoolError::Io(std::io::Error::other(e)))?
        .map_err(PoolError::Io)?;

        temp.persist(&target)
            .map_err(|e| PoolError::Io(e.error))?;

        debug!(path = %target.display(), "session vaulted");
        Ok(())
    }

    /// Remove a session file; missing files are fine (retire is
    /// idempotent).
    pub async fn delete(&self, key: &SessionKey) -> PoolResult<()> {
        let path = self.file_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PoolError::Io(e)),
        }
    }

    /// Load every session file in the vault. Unreadable files are logged
    /// and skipped, never fatal.
    pub async fn load_all(&self) -> PoolResult<Vec<SessionRecord>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(PoolError::Io)?;

        while let Some(entry) = entries.next_entry().await.map_err(PoolError::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<SessionRecord>(&bytes) {
                    Ok(record) => sessions.push(record),
                    Err(e) => {
                        warn!(path = %path.display(), "dropping unreadable session file: {e}");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), "failed to read session file: {e}");
                }
            }
        }

        Ok(sessions)
    }
}

fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_unix;

    fn record(domain: &str) -> SessionRecord {
        SessionRecord {
            domain: domain.to_string(),
            proxy_identity: "default".to_string(),
            cookies: vec![serde_json::json!({"name": "sid", "value": "abc"})],
            storage_state: serde_json::json!({}),
            user_agent: "test-ua".to_string(),
            viewport: (1920, 1080),
            created_at: now_unix(),
            last_used: now_unix(),
            last_success_at: None,
            total_uses: 0,
            consecutive_failures: 0,
            captcha_count: 0,
            health: SessionHealth::Valid,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn save_load_delete_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = SessionVault::open(dir.path()).await.expect("open vault");

        let rec = record("example.com");
        vault.save(&rec).await.expect("save");

        let loaded = vault.load_all().await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].domain, "example.com");
        assert_eq!(loaded[0].cookies.len(), 1);

        vault.delete(&rec.key()).await.expect("delete");
        assert!(vault.load_all().await.expect("load after delete").is_empty());

        // Second delete is a no-op
        vault.delete(&rec.key()).await.expect("idempotent delete");
    }

    #[tokio::test]
    async fn hostile_key_characters_are_sanitized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = SessionVault::open(dir.path()).await.expect("open vault");

        let mut rec = record("example.com");
        rec.proxy_identity = "proxy/../../etc".to_string();
        vault.save(&rec).await.expect("save");

        // The file must land inside the vault directory
        let loaded = vault.load_all().await.expect("load");
        assert_eq!(loaded.len(), 1);
    }
}
