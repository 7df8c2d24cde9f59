//! Metadata store — durable `slot_save_id -> CacheEntry` mapping.
//!
//! One small self-describing JSON record per entry, named `<save_id>.json`
//! under `META_DIR`. Writes are atomic (write to a temp file in the same
//! directory, fsync, rename) so a crash never leaves a half-written
//! record behind.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::fingerprint::{BlockSignature, Fingerprint};

/// One persisted cache entry: the backend-side KV save plus the
/// fingerprint it was produced from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    /// Opaque backend save identifier; also the record's file stem.
    pub save_id: String,
    /// Model id this entry was produced under. Never shared cross-model.
    pub model: String,
    /// Ordered block signatures (the full fingerprint).
    pub signatures: Vec<BlockSignature>,
    /// Total whitespace-delimited word count of the source prompt.
    pub word_count: usize,
    pub created_at: SystemTime,
    pub last_used_at: SystemTime,
    /// Best-effort size of the backend-side KV file, if known.
    pub bytes_on_disk: Option<u64>,
}

impl CacheEntry {
    pub fn new(save_id: String, model: String, fp: Fingerprint) -> Self {
        let now = SystemTime::now();
        Self {
            save_id,
            model,
            signatures: fp.signatures,
            word_count: fp.word_count,
            created_at: now,
            last_used_at: now,
            bytes_on_disk: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            signatures: self.signatures.clone(),
            word_count: self.word_count,
        }
    }
}

/// On-disk record shape. Timestamps are stored as RFC3339 strings so
/// records remain human-inspectable; `SystemTime` itself isn't directly
/// `Serialize` in a portable way across platforms.
#[derive(Serialize, Deserialize)]
struct Record {
    save_id: String,
    model: String,
    signatures: Vec<BlockSignature>,
    word_count: usize,
    created_at: chrono::DateTime<chrono::Utc>,
    last_used_at: chrono::DateTime<chrono::Utc>,
    bytes_on_disk: Option<u64>,
}

impl From<&CacheEntry> for Record {
    fn from(e: &CacheEntry) -> Self {
        Record {
            save_id: e.save_id.clone(),
            model: e.model.clone(),
            signatures: e.signatures.clone(),
            word_count: e.word_count,
            created_at: e.created_at.into(),
            last_used_at: e.last_used_at.into(),
            bytes_on_disk: e.bytes_on_disk,
        }
    }
}

impl From<Record> for CacheEntry {
    fn from(r: Record) -> Self {
        CacheEntry {
            save_id: r.save_id,
            model: r.model,
            signatures: r.signatures,
            word_count: r.word_count,
            created_at: r.created_at.into(),
            last_used_at: r.last_used_at.into(),
            bytes_on_disk: r.bytes_on_disk,
        }
    }
}

/// Durable metadata store backed by `META_DIR`.
///
/// The in-memory map is an index into the on-disk records; every
/// mutating call keeps both in sync, writing the record first so a
/// crash between the two never leaves the in-memory view ahead of disk.
#[derive(Clone)]
pub struct MetadataStore {
    dir: PathBuf,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

/// One record that failed to parse during startup recovery.
#[derive(Debug)]
pub struct CorruptRecord {
    pub path: PathBuf,
    pub reason: String,
}

impl MetadataStore {
    /// Scan `dir` for existing records, load the parseable ones, and
    /// quarantine (move aside) the rest. Never fails startup: corrupt
    /// records are reported, not propagated as an error.
    pub fn load(dir: impl AsRef<Path>) -> std::io::Result<(Self, Vec<CorruptRecord>)> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        let mut corrupt = Vec::new();

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(raw) => match serde_json::from_str::<Record>(&raw) {
                    Ok(record) => {
                        let cache_entry: CacheEntry = record.into();
                        entries.insert(cache_entry.save_id.clone(), cache_entry);
                    }
                    Err(err) => {
                        quarantine(&path);
                        corrupt.push(CorruptRecord {
                            path,
                            reason: err.to_string(),
                        });
                    }
                },
                Err(err) => {
                    corrupt.push(CorruptRecord {
                        path,
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok((
            Self {
                dir,
                entries: Arc::new(RwLock::new(entries)),
            },
            corrupt,
        ))
    }

    /// All currently-loaded entries, for handing off to the LCP index
    /// on startup.
    pub fn all(&self) -> Vec<CacheEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn get(&self, save_id: &str) -> Option<CacheEntry> {
        self.entries.read().get(save_id).cloned()
    }

    /// Persist a new entry: write-temp, fsync, rename, then update the
    /// in-memory index. Returns the error without touching the
    /// in-memory map on I/O failure, so the two never diverge.
    pub fn insert(&self, entry: CacheEntry) -> std::io::Result<()> {
        self.write_record(&entry)?;
        self.entries
            .write()
            .insert(entry.save_id.clone(), entry);
        Ok(())
    }

    /// Bump `last_used_at` on a hit and persist the change.
    pub fn touch(&self, save_id: &str) -> std::io::Result<()> {
        let updated = {
            let mut guard = self.entries.write();
            match guard.get_mut(save_id) {
                Some(e) => {
                    e.last_used_at = SystemTime::now();
                    Some(e.clone())
                }
                None => None,
            }
        };
        if let Some(entry) = updated {
            self.write_record(&entry)?;
        }
        Ok(())
    }

    /// Remove an entry's record and in-memory mapping. Idempotent.
    pub fn remove(&self, save_id: &str) -> std::io::Result<()> {
        self.entries.write().remove(save_id);
        let path = self.record_path(save_id);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn record_path(&self, save_id: &str) -> PathBuf {
        self.dir.join(format!("{save_id}.json"))
    }

    fn write_record(&self, entry: &CacheEntry) -> std::io::Result<()> {
        let record = Record::from(entry);
        let json = serde_json::to_vec_pretty(&record)?;

        let final_path = self.record_path(&entry.save_id);
        let tmp_path = self.dir.join(format!("{}.tmp", entry.save_id));

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

/// Move an unparseable record aside rather than deleting it, so an
/// operator can inspect what went wrong.
fn quarantine(path: &Path) {
    let quarantined = path.with_extension("json.corrupt");
    if let Err(err) = std::fs::rename(path, &quarantined) {
        tracing::warn!(path = %path.display(), error = %err, "failed to quarantine corrupt metadata record");
    } else {
        tracing::warn!(path = %quarantined.display(), "quarantined corrupt metadata record");
    }
}
