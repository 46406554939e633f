//! Durable record store + raw payload archive for the ad library mirror.

use std::path::{Path, PathBuf};

use adm_core::{AdRecord, PageMetadata};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adm-storage";

const METADATA_FILE: &str = "metadata.json";
const METADATA_STEM: &str = "metadata";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted side of a sync: one container per page holding its records and metadata.
///
/// Implementations are accessed by a single writer per page at a time; they do
/// no locking of their own.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ensure_container(&self, page_id: &str) -> Result<(), StoreError>;

    async fn put(&self, page_id: &str, record_id: &str, record: &AdRecord) -> Result<(), StoreError>;

    async fn get(&self, page_id: &str, record_id: &str) -> Result<Option<AdRecord>, StoreError>;

    async fn list_all(&self, page_id: &str) -> Result<Vec<AdRecord>, StoreError>;

    async fn put_metadata(&self, page_id: &str, metadata: &PageMetadata) -> Result<(), StoreError>;

    async fn get_metadata(&self, page_id: &str) -> Result<Option<PageMetadata>, StoreError>;

    /// Pages that have completed at least one sync (i.e. carry metadata).
    async fn list_pages(&self) -> Result<Vec<String>, StoreError>;
}

/// Default on-disk layout: `<root>/<page_id>/<archive_id>.json` plus
/// `<root>/<page_id>/metadata.json`, all pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn page_dir(&self, page_id: &str) -> Result<PathBuf, StoreError> {
        validate_key(page_id)?;
        Ok(self.root.join(page_id))
    }

    fn record_path(&self, page_id: &str, record_id: &str) -> Result<PathBuf, StoreError> {
        validate_key(record_id)?;
        if record_id == METADATA_STEM {
            return Err(StoreError::InvalidKey {
                key: record_id.to_string(),
                reason: "reserved for page metadata",
            });
        }
        Ok(self.page_dir(page_id)?.join(format!("{record_id}.json")))
    }

    fn metadata_path(&self, page_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.page_dir(page_id)?.join(METADATA_FILE))
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn ensure_container(&self, page_id: &str) -> Result<(), StoreError> {
        let dir = self.page_dir(page_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io { path: dir, source })
    }

    async fn put(&self, page_id: &str, record_id: &str, record: &AdRecord) -> Result<(), StoreError> {
        let path = self.record_path(page_id, record_id)?;
        self.ensure_container(page_id).await?;
        write_json(&path, record).await?;
        debug!(page_id, record_id, "stored ad record");
        Ok(())
    }

    async fn get(&self, page_id: &str, record_id: &str) -> Result<Option<AdRecord>, StoreError> {
        read_json(&self.record_path(page_id, record_id)?).await
    }

    async fn list_all(&self, page_id: &str) -> Result<Vec<AdRecord>, StoreError> {
        let dir = self.page_dir(page_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut records = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let Some(entry) = entry else {
                break;
            };
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name == METADATA_FILE || !name.ends_with(".json") {
                continue;
            }
            if let Some(record) = read_json::<AdRecord>(&entry.path()).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.ad_archive_id.cmp(&b.ad_archive_id));
        debug!(page_id, records = records.len(), "listed stored records");
        Ok(records)
    }

    async fn put_metadata(&self, page_id: &str, metadata: &PageMetadata) -> Result<(), StoreError> {
        let path = self.metadata_path(page_id)?;
        self.ensure_container(page_id).await?;
        write_json(&path, metadata).await
    }

    async fn get_metadata(&self, page_id: &str) -> Result<Option<PageMetadata>, StoreError> {
        read_json(&self.metadata_path(page_id)?).await
    }

    async fn list_pages(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut pages = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })? {
            let file_type = entry.file_type().await.map_err(|source| StoreError::Io {
                path: entry.path(),
                source,
            })?;
            if !file_type.is_dir() {
                continue;
            }
            let metadata_path = entry.path().join(METADATA_FILE);
            let tracked = fs::try_exists(&metadata_path)
                .await
                .map_err(|source| StoreError::Io {
                    path: metadata_path,
                    source,
                })?;
            if tracked {
                pages.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        pages.sort();
        Ok(pages)
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let reason = if key.is_empty() {
        Some("empty")
    } else if key.contains(['/', '\\']) {
        Some("contains a path separator")
    } else if key.starts_with('.') {
        Some("starts with a dot")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Write via a sibling temp file and rename so readers never observe a torn document.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed capture of the raw response payloads a run consumed.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn payload_relative_path(
        run_started: DateTime<Utc>,
        page_id: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(run_started.format("%Y%m%d_%H%M%S").to_string())
            .join(page_id)
            .join(format!("{content_hash}.json"))
    }

    /// Store one payload; identical bytes within a run land on the same path and are written once.
    pub async fn archive(
        &self,
        run_started: DateTime<Utc>,
        page_id: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        validate_key(page_id)?;
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::payload_relative_path(run_started, page_id, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating payload directory {}", parent.display()))?;
        }

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking payload path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes)
                .await
                .with_context(|| format!("writing payload {}", absolute_path.display()))?;
        }

        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adm_core::Liveness;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn ad(page_id: &str, archive_id: &str) -> AdRecord {
        let mut record = AdRecord::new(page_id, archive_id);
        record.page_name = Some("Test Page".into());
        record.ad_snapshot_url = Some(format!("https://example.test/snapshot/{archive_id}"));
        record
    }

    fn metadata(page_id: &str) -> PageMetadata {
        PageMetadata {
            page_id: page_id.to_string(),
            page_name: Some("Test Page".into()),
            last_synced: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            total_ads: 100,
            active_ads: 75,
            inactive_ads: 25,
        }
    }

    #[tokio::test]
    async fn ensure_container_creates_page_directory() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        store.ensure_container("123").await.unwrap();
        assert!(dir.path().join("123").is_dir());
    }

    #[tokio::test]
    async fn saves_and_reads_back_records_with_extension_fields() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        let mut record = ad("456", "123");
        record.extra.insert("ad_creative_bodies".into(), json!(["Hello"]));

        store.put("456", "123", &record).await.unwrap();
        let fetched = store.get("456", "123").await.unwrap().expect("stored record");
        assert_eq!(fetched, record);
        assert!(dir.path().join("456").join("123.json").exists());
    }

    #[tokio::test]
    async fn missing_record_and_metadata_read_as_absent() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        assert!(store.get("1", "2").await.unwrap().is_none());
        assert!(store.get_metadata("1").await.unwrap().is_none());
        assert!(store.list_all("1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_the_whole_record() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        let original = ad("9", "1");
        store.put("9", "1", &original).await.unwrap();

        let retired = original.retired_at(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).single().unwrap());
        store.put("9", "1", &retired).await.unwrap();

        let fetched = store.get("9", "1").await.unwrap().unwrap();
        assert_eq!(fetched.liveness, Liveness::Inactive);
        assert!(fetched.ad_delivery_stop_time.is_some());
    }

    #[tokio::test]
    async fn list_all_skips_metadata_and_sorts_by_archive_id() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        for id in ["3", "1", "2"] {
            store.put("multi", id, &ad("multi", id)).await.unwrap();
        }
        store.put_metadata("multi", &metadata("multi")).await.unwrap();

        let records = store.list_all("multi").await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.ad_archive_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn metadata_round_trips_and_marks_page_tracked() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        store.ensure_container("untracked").await.unwrap();
        store.put_metadata("789", &metadata("789")).await.unwrap();

        let fetched = store.get_metadata("789").await.unwrap().expect("metadata");
        assert_eq!(fetched, metadata("789"));
        assert_eq!(store.list_pages().await.unwrap(), vec!["789".to_string()]);
    }

    #[tokio::test]
    async fn stray_files_in_the_root_are_not_pages() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        store.put_metadata("789", &metadata("789")).await.unwrap();
        std::fs::write(dir.path().join("README"), "notes").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), [0u8; 4]).unwrap();

        assert_eq!(store.list_pages().await.unwrap(), vec!["789".to_string()]);
    }

    #[tokio::test]
    async fn rejects_keys_that_escape_the_container() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        let record = ad("p", "x");

        for (page, id) in [("../p", "x"), ("p", "a/b"), ("p", "metadata"), ("", "x")] {
            let err = store.put(page, id, &record).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey { .. }), "{page:?}/{id:?}");
        }
    }

    #[tokio::test]
    async fn malformed_document_is_reported_with_its_path() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        store.ensure_container("bad").await.unwrap();
        std::fs::write(dir.path().join("bad").join("1.json"), b"{not json").unwrap();

        let err = store.list_all("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        assert!(err.to_string().contains("1.json"));
    }

    #[test]
    fn payload_hashing_is_stable() {
        assert_eq!(
            PayloadArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let started = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();

        let first = archive.archive(started, "123", br#"{"data":{}}"#).await.unwrap();
        let second = archive.archive(started, "123", br#"{"data":{}}"#).await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260224_120000/123"));
        assert!(dir.path().join(&first.relative_path).exists());
    }
}
