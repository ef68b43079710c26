//! File-based blob store
//!
//! Each entry is a payload file plus a JSON metadata record:
//!
//! ```text
//! <key>.json                  metadata record, names the current payload
//! <key>.<generation>.bin      payload
//! <key>.<generation>.bin.part payload still being written
//! ```
//!
//! The metadata record is the commit point. It is replaced with an atomic
//! rename only after the payload is fully written and synced, and readers
//! always reach the payload through it, so a reader sees either the previous
//! entry or the new one, never a mix.

use crate::error::StoreError;
use crate::types::{ByteStream, CacheKey, ResourceMetadata, StoredEntry};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Leftover temp files younger than this may belong to a live writer
const STALE_FILE_AGE: Duration = Duration::from_secs(60 * 60);

/// On-disk metadata record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataRecord {
    content_type: String,
    content_length: u64,
    payload: String,
    stored_at: DateTime<Utc>,
}

/// A stored entry opened for reading
pub struct StoredBlob {
    pub metadata: ResourceMetadata,
    pub body: ByteStream,
    pub stored_at: DateTime<Utc>,
}

/// Durable payload + metadata storage keyed by [`CacheKey`]
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the directory exists and return the committed entries found in it
    pub async fn init(&self) -> StoreResult<Vec<StoredEntry>> {
        fs::create_dir_all(&self.dir).await?;
        let entries = self.scan().await?;
        info!(cache_dir = ?self.dir, entries = entries.len(), "Blob store initialized");
        Ok(entries)
    }

    /// Start writing a new generation of `key`'s payload
    pub async fn begin_write(&self, key: &CacheKey) -> StoreResult<BlobWriter> {
        let generation = uuid::Uuid::new_v4().simple().to_string();
        let part_path = self.dir.join(format!("{}.{}.bin.part", key, generation));
        let file = File::create(&part_path).await?;

        Ok(BlobWriter {
            dir: self.dir.clone(),
            key: key.clone(),
            generation,
            part_path,
            file: Some(BufWriter::new(file)),
            written: 0,
            committed: false,
        })
    }

    /// Persist a whole stream as the new entry for `key`.
    ///
    /// Nothing becomes visible to readers unless the stream ends cleanly and,
    /// when `content_length` is given, delivers exactly that many bytes.
    pub async fn write(
        &self,
        key: &CacheKey,
        content_type: &str,
        content_length: Option<u64>,
        mut body: ByteStream,
    ) -> StoreResult<StoredEntry> {
        let mut writer = self.begin_write(key).await?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StoreError::Incomplete(e.to_string()))?;
            writer.write_chunk(&chunk).await?;
        }
        writer.commit(content_type, content_length).await
    }

    /// Open the committed entry for `key`
    pub async fn read(&self, key: &CacheKey) -> StoreResult<StoredBlob> {
        let record = self.read_record(key).await?;
        if !is_payload_name(key, &record.payload) {
            return Err(StoreError::Corrupt(format!(
                "unexpected payload name {}",
                record.payload
            )));
        }

        // The payload may have been replaced or removed since the record was read
        let file = match File::open(self.dir.join(&record.payload)).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata().await?.len();
        if size != record.content_length {
            return Err(StoreError::Corrupt(format!(
                "payload is {} bytes, metadata says {}",
                size, record.content_length
            )));
        }

        Ok(StoredBlob {
            metadata: ResourceMetadata {
                content_type: record.content_type,
                content_length: Some(record.content_length),
            },
            body: ReaderStream::new(file).boxed(),
            stored_at: record.stored_at,
        })
    }

    /// Delete the entry for `key`; deleting an absent entry succeeds
    pub async fn delete(&self, key: &CacheKey) -> StoreResult<()> {
        let record = match self.read_record(key).await {
            Ok(record) => Some(record),
            Err(StoreError::NotFound) | Err(StoreError::Corrupt(_)) => None,
            Err(e) => return Err(e),
        };

        // Metadata first: once it is gone the entry is unreachable
        remove_if_exists(&self.metadata_path(key)).await?;

        if let Some(record) = record {
            if is_payload_name(key, &record.payload) {
                remove_if_exists(&self.dir.join(&record.payload)).await?;
            }
        }

        debug!(key = %key, "Deleted blob");
        Ok(())
    }

    /// List committed entries, oldest first, removing abandoned temp files,
    /// unreferenced payloads and records whose payload is missing
    pub async fn scan(&self) -> StoreResult<Vec<StoredEntry>> {
        let mut records = Vec::new();
        let mut payloads = Vec::new();

        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.ends_with(".part") || name.ends_with(".tmp") {
                if is_stale(&entry).await {
                    debug!(file = %name, "Removing abandoned temp file");
                    let _ = fs::remove_file(entry.path()).await;
                }
            } else if let Some(key) = name.strip_suffix(".json").and_then(CacheKey::from_hex) {
                records.push(key);
            } else if name.ends_with(".bin") {
                payloads.push(entry);
            }
        }

        let mut referenced = HashSet::new();
        let mut entries = Vec::new();

        for key in records {
            let record = match self.read_record(&key).await {
                Ok(record) => record,
                Err(StoreError::NotFound) => continue,
                Err(StoreError::Corrupt(e)) => {
                    warn!(key = %key, error = %e, "Dropping corrupt blob metadata");
                    let _ = fs::remove_file(self.metadata_path(&key)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let intact = is_payload_name(&key, &record.payload)
                && fs::metadata(self.dir.join(&record.payload))
                    .await
                    .is_ok_and(|m| m.len() == record.content_length);
            if !intact {
                warn!(key = %key, "Dropping blob entry with missing or mismatched payload");
                let _ = fs::remove_file(self.metadata_path(&key)).await;
                continue;
            }

            entries.push(StoredEntry {
                key,
                content_type: record.content_type,
                size: record.content_length,
                stored_at: record.stored_at,
            });
            referenced.insert(record.payload);
        }

        for payload in payloads {
            let name = payload.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) && is_stale(&payload).await {
                debug!(file = %name, "Removing unreferenced payload");
                let _ = fs::remove_file(payload.path()).await;
            }
        }

        entries.sort_by_key(|e| e.stored_at);
        Ok(entries)
    }

    fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        metadata_path(&self.dir, key)
    }

    async fn read_record(&self, key: &CacheKey) -> StoreResult<MetadataRecord> {
        let bytes = match fs::read(self.metadata_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// In-progress write of one payload generation.
///
/// Dropping it without calling [`BlobWriter::commit`] discards the partial file.
pub struct BlobWriter {
    dir: PathBuf,
    key: CacheKey,
    generation: String,
    part_path: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
    committed: bool,
}

impl BlobWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> StoreResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Incomplete("writer already closed".to_string()))?;
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Make the written payload the current entry for its key
    pub async fn commit(
        mut self,
        content_type: &str,
        content_length: Option<u64>,
    ) -> StoreResult<StoredEntry> {
        if let Some(expected) = content_length {
            if expected != self.written {
                return Err(StoreError::Incomplete(format!(
                    "expected {} bytes, received {}",
                    expected, self.written
                )));
            }
        }

        let mut file = self
            .file
            .take()
            .ok_or_else(|| StoreError::Incomplete("writer already closed".to_string()))?;
        file.flush().await?;
        file.get_ref().sync_all().await?;
        drop(file);

        let payload = format!("{}.{}.bin", self.key, self.generation);
        let payload_path = self.dir.join(&payload);
        fs::rename(&self.part_path, &payload_path).await?;

        let meta_path = metadata_path(&self.dir, &self.key);
        let previous = match fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice::<MetadataRecord>(&bytes).ok(),
            Err(_) => None,
        };

        let record = MetadataRecord {
            content_type: content_type.to_string(),
            content_length: self.written,
            payload: payload.clone(),
            stored_at: Utc::now(),
        };

        if let Err(e) = self.publish(&record, &meta_path).await {
            let _ = fs::remove_file(&payload_path).await;
            return Err(e);
        }
        self.committed = true;

        if let Some(previous) = previous {
            if previous.payload != payload && is_payload_name(&self.key, &previous.payload) {
                let _ = fs::remove_file(self.dir.join(&previous.payload)).await;
            }
        }

        debug!(key = %self.key, size = self.written, "Committed blob");
        Ok(StoredEntry {
            key: self.key.clone(),
            content_type: record.content_type,
            size: record.content_length,
            stored_at: record.stored_at,
        })
    }

    /// Write the record beside its final path, sync it, then rename it into place
    async fn publish(&self, record: &MetadataRecord, meta_path: &Path) -> StoreResult<()> {
        let json = serde_json::to_vec(record)?;
        let tmp_path = self
            .dir
            .join(format!("{}.json.{}.tmp", self.key, self.generation));

        let result = async {
            let mut tmp = File::create(&tmp_path).await?;
            tmp.write_all(&json).await?;
            tmp.sync_all().await?;
            fs::rename(&tmp_path, meta_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}

fn metadata_path(dir: &Path, key: &CacheKey) -> PathBuf {
    dir.join(format!("{}.json", key))
}

/// Payload names must stay inside the store and belong to their key
fn is_payload_name(key: &CacheKey, name: &str) -> bool {
    name.strip_prefix(key.as_str())
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(".bin"))
        .is_some_and(|generation| {
            !generation.is_empty() && generation.chars().all(|c| c.is_ascii_alphanumeric())
        })
}

async fn is_stale(entry: &fs::DirEntry) -> bool {
    let modified = match entry.metadata().await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= STALE_FILE_AGE)
        .unwrap_or(false)
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
