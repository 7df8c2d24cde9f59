//! Cache janitor — background loop enforcing age and total-size bounds
//! on the on-disk KV-file directory and metadata directory.
//!
//! Each tick runs three passes in order (age, size, orphan), per design
//! §4.7. Every deletion goes through `MetadataStore::remove` and
//! `LcpIndex::remove` so the index never outlives its backing record.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::lcp_index::LcpIndex;
use crate::metadata::MetadataStore;

/// Summary of one janitor tick, logged and available for the health
/// endpoint.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub files_scanned: usize,
    pub aged_out: usize,
    pub size_evicted: usize,
    pub orphan_kv_files: usize,
    pub orphan_metadata: usize,
    pub bytes_reclaimed: u64,
}

pub struct Janitor {
    meta: MetadataStore,
    index: std::sync::Arc<LcpIndex>,
    cache_dir: PathBuf,
    max_age: Option<Duration>,
    max_size_bytes: u64,
}

impl Janitor {
    pub fn new(
        meta: MetadataStore,
        index: std::sync::Arc<LcpIndex>,
        cache_dir: PathBuf,
        max_age: Option<Duration>,
        max_size_bytes: u64,
    ) -> Self {
        Self {
            meta,
            index,
            cache_dir,
            max_age,
            max_size_bytes,
        }
    }

    /// Run the loop forever at `interval`, until the process exits.
    /// Never panics on a single file's I/O error — it logs and moves
    /// on to the next candidate, per design §7. `last_run` is updated
    /// after every tick so `/health` can report janitor liveness.
    pub async fn run_forever(
        self,
        interval: Duration,
        last_run: std::sync::Arc<parking_lot::RwLock<Option<SystemTime>>>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let report = self.sweep();
            *last_run.write() = Some(SystemTime::now());
            tracing::info!(
                files_scanned = report.files_scanned,
                aged_out = report.aged_out,
                size_evicted = report.size_evicted,
                orphan_kv_files = report.orphan_kv_files,
                orphan_metadata = report.orphan_metadata,
                bytes_reclaimed = report.bytes_reclaimed,
                "janitor sweep complete"
            );
        }
    }

    /// Run one tick synchronously (blocking I/O). Exposed separately
    /// from `run_forever` so tests can invoke a single sweep
    /// deterministically.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let kv_files = list_kv_files(&self.cache_dir);
        report.files_scanned = kv_files.len();

        // --- Age pass ---
        if let Some(max_age) = self.max_age {
            let now = SystemTime::now();
            for entry in self.meta.all() {
                let age_basis = entry.last_used_at;
                if now
                    .duration_since(age_basis)
                    .unwrap_or(Duration::ZERO)
                    > max_age
                {
                    let bytes = kv_file_size(&self.cache_dir, &entry.save_id);
                    self.evict(&entry.save_id, &kv_files);
                    report.aged_out += 1;
                    report.bytes_reclaimed += bytes;
                }
            }
        }

        // --- Size pass ---
        let kv_files = list_kv_files(&self.cache_dir); // re-scan post age-pass
        let mut entries: Vec<_> = self.meta.all();
        entries.sort_by_key(|e| e.last_used_at);

        let mut total: u64 = kv_files.iter().filter_map(|p| file_size(p)).sum();
        for entry in entries {
            if total <= self.max_size_bytes {
                break;
            }
            let bytes = kv_file_size(&self.cache_dir, &entry.save_id);
            self.evict(&entry.save_id, &kv_files);
            total = total.saturating_sub(bytes);
            report.size_evicted += 1;
            report.bytes_reclaimed += bytes;
        }

        // --- Orphan pass ---
        let kv_files = list_kv_files(&self.cache_dir);
        let known_save_ids: std::collections::HashSet<String> =
            self.meta.all().into_iter().map(|e| e.save_id).collect();

        for path in &kv_files {
            if let Some(save_id) = save_id_of(path) {
                if !known_save_ids.contains(&save_id) {
                    let bytes = file_size(path).unwrap_or(0);
                    if std::fs::remove_file(path).is_ok() {
                        report.orphan_kv_files += 1;
                        report.bytes_reclaimed += bytes;
                    } else {
                        tracing::warn!(path = %path.display(), "failed to remove orphan kv file");
                    }
                }
            }
        }

        for entry in self.meta.all() {
            let has_kv = kv_files.iter().any(|p| save_id_of(p).as_deref() == Some(entry.save_id.as_str()));
            if !has_kv {
                self.evict(&entry.save_id, &kv_files);
                report.orphan_metadata += 1;
            }
        }

        report
    }

    /// Remove metadata, index entry, and (if still present) the KV
    /// file for `save_id`. Logs and continues on any single I/O error.
    fn evict(&self, save_id: &str, kv_files: &[PathBuf]) {
        self.index.remove(save_id);
        if let Err(err) = self.meta.remove(save_id) {
            tracing::warn!(save_id, error = %err, "failed to remove metadata record");
        }
        if let Some(path) = kv_files
            .iter()
            .find(|p| save_id_of(p).as_deref() == Some(save_id))
        {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove kv file");
            }
        }
    }
}

fn list_kv_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "failed to read cache dir");
            Vec::new()
        }
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

fn kv_file_size(dir: &Path, save_id: &str) -> u64 {
    list_kv_files(dir)
        .iter()
        .find(|p| save_id_of(p).as_deref() == Some(save_id))
        .and_then(|p| file_size(p))
        .unwrap_or(0)
}

/// KV files are named `<save_id>.<backend-defined suffix>`; the save id
/// is the file stem.
fn save_id_of(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint as fp;
    use crate::metadata::CacheEntry;
    use std::time::Duration;

    fn write_kv_file(dir: &Path, save_id: &str, bytes: &[u8]) {
        std::fs::write(dir.join(format!("{save_id}.kv")), bytes).unwrap();
    }

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, MetadataStore, std::sync::Arc<LcpIndex>) {
        let meta_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let (meta, _) = MetadataStore::load(meta_dir.path()).unwrap();
        let index = std::sync::Arc::new(LcpIndex::new());
        (meta_dir, cache_dir, meta, index)
    }

    #[test]
    fn size_pass_evicts_lru_first() {
        let (_meta_dir, cache_dir, meta, index) = setup();

        let mut e1 = CacheEntry::new("s1".into(), "m".into(), fp("a b c d", 4));
        e1.last_used_at = SystemTime::now() - Duration::from_secs(100);
        let mut e2 = CacheEntry::new("s2".into(), "m".into(), fp("e f g h", 4));
        e2.last_used_at = SystemTime::now();

        meta.insert(e1.clone()).unwrap();
        meta.insert(e2.clone()).unwrap();
        index.insert(e1.clone());
        index.insert(e2.clone());

        write_kv_file(cache_dir.path(), "s1", &[0u8; 100]);
        write_kv_file(cache_dir.path(), "s2", &[0u8; 100]);

        // Bound just above one entry's size: only the LRU should survive eviction.
        let janitor = Janitor::new(meta.clone(), index.clone(), cache_dir.path().to_path_buf(), None, 150);
        let report = janitor.sweep();

        assert_eq!(report.size_evicted, 1);
        assert!(meta.get("s1").is_none());
        assert!(meta.get("s2").is_some());
        assert!(!cache_dir.path().join("s1.kv").exists());
        assert!(cache_dir.path().join("s2.kv").exists());

        let query = fp("a b c d", 4);
        assert!(index.best_candidate("m", &query, 0.5).is_none());
    }

    #[test]
    fn age_pass_evicts_stale_entries() {
        let (_meta_dir, cache_dir, meta, index) = setup();

        let mut stale = CacheEntry::new("old".into(), "m".into(), fp("a b c d", 4));
        stale.last_used_at = SystemTime::now() - Duration::from_secs(3600 * 10);
        meta.insert(stale.clone()).unwrap();
        index.insert(stale);
        write_kv_file(cache_dir.path(), "old", &[0u8; 10]);

        let janitor = Janitor::new(
            meta.clone(),
            index,
            cache_dir.path().to_path_buf(),
            Some(Duration::from_secs(3600)),
            u64::MAX,
        );
        let report = janitor.sweep();

        assert_eq!(report.aged_out, 1);
        assert!(meta.get("old").is_none());
        assert!(!cache_dir.path().join("old.kv").exists());
    }

    #[test]
    fn orphan_kv_file_without_metadata_is_removed() {
        let (_meta_dir, cache_dir, meta, index) = setup();
        write_kv_file(cache_dir.path(), "ghost", &[0u8; 10]);

        let janitor = Janitor::new(meta, index, cache_dir.path().to_path_buf(), None, u64::MAX);
        let report = janitor.sweep();

        assert_eq!(report.orphan_kv_files, 1);
        assert!(!cache_dir.path().join("ghost.kv").exists());
    }

    #[test]
    fn orphan_metadata_without_kv_file_is_removed() {
        let (_meta_dir, cache_dir, meta, index) = setup();
        let entry = CacheEntry::new("missing-kv".into(), "m".into(), fp("a b c d", 4));
        meta.insert(entry.clone()).unwrap();
        index.insert(entry);

        let janitor = Janitor::new(meta.clone(), index, cache_dir.path().to_path_buf(), None, u64::MAX);
        let report = janitor.sweep();

        assert_eq!(report.orphan_metadata, 1);
        assert!(meta.get("missing-kv").is_none());
    }

    #[test]
    fn convergence_after_steady_state_sweep() {
        let (_meta_dir, cache_dir, meta, index) = setup();
        for i in 0..5 {
            let mut e = CacheEntry::new(format!("s{i}"), "m".into(), fp("a b c d", 4));
            e.last_used_at = SystemTime::now() - Duration::from_secs(i as u64);
            meta.insert(e.clone()).unwrap();
            index.insert(e);
            write_kv_file(cache_dir.path(), &format!("s{i}"), &[0u8; 100]);
        }

        let janitor = Janitor::new(meta.clone(), index, cache_dir.path().to_path_buf(), None, 250);
        janitor.sweep();

        let total: u64 = list_kv_files(cache_dir.path())
            .iter()
            .filter_map(file_size)
            .sum();
        assert!(total <= 250);
    }
}
