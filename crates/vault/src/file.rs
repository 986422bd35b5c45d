//! Encrypted store files and append-only encrypted line logs.
//!
//! `EncryptedFile` is the whole-store snapshot primitive: serialize
//! `{payload, timestamp}`, seal, write to a `.tmp` sibling, fsync, rename.
//! A crash before the rename leaves the previous snapshot intact; a crash
//! after leaves a fully consistent new one.
//!
//! `EncryptedLineLog` is the audit primitive: one sealed envelope per line,
//! append + fsync, records never rewritten.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::envelope::{Envelope, open, seal};
use crate::{VaultError, VaultResult};

#[derive(Debug, Serialize, Deserialize)]
struct Stamped<T> {
    payload: T,
    timestamp: i64,
}

/// A single encrypted JSON store file with atomic replacement.
pub struct EncryptedFile {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedFile {
    pub fn new(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        Self { path: path.into(), key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Seal and persist `payload`, replacing any previous snapshot
    /// atomically.  Returns only after the new file is fsynced.
    pub async fn save<T: Serialize>(&self, payload: &T) -> VaultResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let stamped = Stamped {
            payload,
            timestamp: now_millis(),
        };
        let plaintext = serde_json::to_vec(&stamped)?;
        let envelope = seal(&self.key, &plaintext)?;
        let rendered = serde_json::to_vec(&envelope)?;

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "store.json".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: VaultResult<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(&rendered).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    /// Load and open the snapshot.  `Ok(None)` when the file does not exist
    /// yet (fresh install); any decryption or parse failure is
    /// [`VaultError::Corrupt`].
    pub async fn load<T: DeserializeOwned>(&self) -> VaultResult<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = tokio::fs::read(&self.path).await?;
        let envelope: Envelope = serde_json::from_slice(&raw).map_err(|e| {
            VaultError::Corrupt(format!("{}: invalid envelope: {e}", self.path.display()))
        })?;
        let plaintext = open(&self.key, &envelope).map_err(|e| match e {
            VaultError::Corrupt(msg) => {
                VaultError::Corrupt(format!("{}: {msg}", self.path.display()))
            }
            other => other,
        })?;
        let stamped: Stamped<T> = serde_json::from_slice(&plaintext).map_err(|e| {
            VaultError::Corrupt(format!("{}: invalid payload: {e}", self.path.display()))
        })?;
        Ok(Some(stamped.payload))
    }
}

/// Append-only log of individually sealed records, one envelope per line.
pub struct EncryptedLineLog {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedLineLog {
    pub fn new(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        Self { path: path.into(), key }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal `record` and append it.  Fsyncs so the record survives a crash
    /// immediately after the call returns.
    pub async fn append<T: Serialize>(&self, record: &T) -> VaultResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let plaintext = serde_json::to_vec(record)?;
        let envelope = seal(&self.key, &plaintext)?;
        let line = serde_json::to_string(&envelope)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Open every record in insertion order.  A single undecryptable line
    /// corrupts the whole log: audit history must not silently lose entries.
    pub async fn load_all<T: DeserializeOwned>(&self) -> VaultResult<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let envelope: Envelope = serde_json::from_str(line).map_err(|e| {
                VaultError::Corrupt(format!(
                    "{} line {}: invalid envelope: {e}",
                    self.path.display(),
                    idx + 1
                ))
            })?;
            let plaintext = open(&self.key, &envelope)?;
            let record: T = serde_json::from_slice(&plaintext).map_err(|e| {
                VaultError::Corrupt(format!(
                    "{} line {}: invalid record: {e}",
                    self.path.display(),
                    idx + 1
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        items: Vec<String>,
        version: u32,
    }

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_add(99);
        }
        key
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = EncryptedFile::new(dir.path().join("memory/episodic.json"), test_key());

        let snapshot = Snapshot {
            items: vec!["a".into(), "b".into()],
            version: 3,
        };
        file.save(&snapshot).await.unwrap();

        let loaded: Snapshot = file.load().await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = EncryptedFile::new(dir.path().join("never-written.json"), test_key());
        let loaded: Option<Snapshot> = file.load().await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let file = EncryptedFile::new(&path, test_key());
        file.save(&Snapshot { items: vec![], version: 1 }).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_file_name("store.json.tmp").exists());
    }

    #[tokio::test]
    async fn random_bytes_on_disk_are_corrupt_not_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episodic.json");
        tokio::fs::write(&path, b"\x00\x01garbage, definitely not an envelope")
            .await
            .unwrap();

        let file = EncryptedFile::new(&path, test_key());
        let result: VaultResult<Option<Snapshot>> = file.load().await;
        assert!(matches!(result, Err(VaultError::Corrupt(_))));
        // The corrupt file must still be on disk untouched.
        assert!(path.exists());
    }

    #[tokio::test]
    async fn wrong_key_on_disk_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        EncryptedFile::new(&path, test_key())
            .save(&Snapshot { items: vec!["x".into()], version: 1 })
            .await
            .unwrap();

        let mut other = test_key();
        other[31] ^= 0x01;
        let result: VaultResult<Option<Snapshot>> = EncryptedFile::new(&path, other).load().await;
        assert!(matches!(result, Err(VaultError::Corrupt(_))));
    }

    #[tokio::test]
    async fn line_log_preserves_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = EncryptedLineLog::new(dir.path().join("logs/audit.log"), test_key());

        for i in 0..5u32 {
            log.append(&Snapshot { items: vec![format!("rec-{i}")], version: i })
                .await
                .unwrap();
        }

        let records: Vec<Snapshot> = log.load_all().await.unwrap();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.version, i as u32);
        }
    }

    #[tokio::test]
    async fn line_log_rejects_tampered_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = EncryptedLineLog::new(&path, test_key());
        log.append(&Snapshot { items: vec![], version: 1 }).await.unwrap();

        // Append a junk line as an attacker editing the file would.
        let mut raw = tokio::fs::read_to_string(&path).await.unwrap();
        raw.push_str("{\"iv\":\"00\",\"authTag\":\"00\",\"data\":\"00\"}\n");
        tokio::fs::write(&path, raw).await.unwrap();

        let result: VaultResult<Vec<Snapshot>> = log.load_all().await;
        assert!(matches!(result, Err(VaultError::Corrupt(_))));
    }
}
