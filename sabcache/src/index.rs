//! Cache index: the typed API over the `cache_index` table plus the
//! on-disk artifact layout (`<cache>/<item>/audio.<ext>` or
//! `<cache>/<item>/segment_NNN.<ext>`).

use crate::error::{CacheError, Result};
use crate::probe::CacheFormat;
use sabstore::{CacheEntry, CacheStatus, NewCacheEntry, Store};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Source fingerprint recorded at entry creation and compared for
/// staleness.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub first_path: PathBuf,
    /// Cumulative size of all source files.
    pub total_size: i64,
    /// mtime of the first source file, unix seconds.
    pub mtime: i64,
}

impl SourceDescriptor {
    pub fn from_files(paths: &[PathBuf]) -> Result<Self> {
        let first = paths
            .first()
            .ok_or_else(|| CacheError::InvalidInput("no source files".to_string()))?;

        let mut total_size: i64 = 0;
        for path in paths {
            let meta = std::fs::metadata(path)
                .map_err(|_| CacheError::InputMissing(path.clone()))?;
            total_size += meta.len() as i64;
        }

        let mtime = std::fs::metadata(first)?
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(Self {
            first_path: first.clone(),
            total_size,
            mtime,
        })
    }
}

#[derive(Clone)]
pub struct CacheIndex {
    store: Arc<Store>,
    cache_root: PathBuf,
}

impl CacheIndex {
    pub fn new(store: Arc<Store>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            cache_root: cache_root.into(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn item_dir(&self, item_id: &str) -> PathBuf {
        self.cache_root.join(sanitize_item_id(item_id))
    }

    pub fn ensure_dir(&self, item_id: &str) -> Result<PathBuf> {
        let dir = self.item_dir(item_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn lookup(&self, item_id: &str) -> Result<Option<CacheEntry>> {
        Ok(self.store.get_cache_entry(item_id)?)
    }

    /// Creates a pending entry; `false` when one already exists.
    pub fn create(
        &self,
        item_id: &str,
        source: &SourceDescriptor,
        format: CacheFormat,
    ) -> Result<bool> {
        let created = self.store.create_cache_entry(&NewCacheEntry {
            item_id: item_id.to_string(),
            source_path: source.first_path.to_string_lossy().into_owned(),
            source_size: source.total_size,
            source_mtime: source.mtime,
            profile_version: crate::probe::PROFILE_VERSION.to_string(),
            cache_format: format.extension().to_string(),
        })?;
        if created {
            debug!("Created pending cache entry for {}", item_id);
        }
        Ok(created)
    }

    /// pending → in_progress; `false` when another builder won.
    pub fn mark_in_progress(&self, item_id: &str) -> Result<bool> {
        Ok(self.store.claim_cache_entry(item_id)?)
    }

    pub fn mark_ready(
        &self,
        item_id: &str,
        duration_sec: f64,
        format: CacheFormat,
        segment_count: u32,
        segment_duration_sec: u32,
    ) -> Result<()> {
        self.store.set_cache_ready(
            item_id,
            duration_sec,
            format.extension(),
            segment_count,
            segment_duration_sec,
        )?;
        info!(
            "✅ Cache ready for {} ({}s, {} segment(s), {})",
            item_id,
            duration_sec as u64,
            segment_count,
            format.extension()
        );
        Ok(())
    }

    pub fn mark_failed(&self, item_id: &str, reason: &str) -> Result<()> {
        warn!("Cache build failed for {}: {}", item_id, reason);
        Ok(self.store.set_cache_failed(item_id, reason)?)
    }

    /// Removes the row and the on-disk artifacts.
    pub fn delete(&self, item_id: &str) -> Result<()> {
        self.store.delete_cache_entry(item_id)?;
        let dir = self.item_dir(item_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Artifact filename inside the item dir.
    pub fn artifact_filename(entry: &CacheEntry, segment_idx: Option<u32>) -> String {
        match segment_idx {
            Some(idx) => format!("segment_{:03}.{}", idx, entry.cache_format),
            None => format!("audio.{}", entry.cache_format),
        }
    }

    /// Full path of the artifact (or one segment). Validates the segment
    /// index against the recorded layout.
    pub fn resolve_artifact_path(
        &self,
        entry: &CacheEntry,
        segment_idx: Option<u32>,
    ) -> Result<PathBuf> {
        match segment_idx {
            Some(idx) => {
                if !entry.is_segmented() {
                    return Err(CacheError::InvalidInput(format!(
                        "{} is not segmented",
                        entry.item_id
                    )));
                }
                if idx >= entry.segment_count {
                    return Err(CacheError::InvalidInput(format!(
                        "segment {} out of range (count {})",
                        idx, entry.segment_count
                    )));
                }
            }
            None => {
                if entry.is_segmented() {
                    return Err(CacheError::InvalidInput(format!(
                        "{} is segmented; a segment index is required",
                        entry.item_id
                    )));
                }
            }
        }

        Ok(self
            .item_dir(&entry.item_id)
            .join(Self::artifact_filename(entry, segment_idx)))
    }

    /// Every file a ready entry must have on disk.
    pub fn expected_paths(&self, entry: &CacheEntry) -> Vec<PathBuf> {
        let dir = self.item_dir(&entry.item_id);
        if entry.is_segmented() {
            (0..entry.segment_count)
                .map(|idx| dir.join(Self::artifact_filename(entry, Some(idx))))
                .collect()
        } else {
            vec![dir.join(Self::artifact_filename(entry, None))]
        }
    }

    pub fn entry_files_exist(&self, entry: &CacheEntry) -> bool {
        self.expected_paths(entry).iter().all(|p| p.exists())
    }

    /// Ready in the index AND every artifact file present on disk.
    pub fn is_cached(&self, item_id: &str) -> Result<bool> {
        match self.lookup(item_id)? {
            Some(entry) if entry.status == CacheStatus::Ready => {
                Ok(self.entry_files_exist(&entry))
            }
            _ => Ok(false),
        }
    }

    /// The source changed out from under the cache.
    pub fn is_stale(entry: &CacheEntry, current_size: i64, current_mtime: i64) -> bool {
        entry.source_size != current_size || entry.source_mtime != current_mtime
    }

    /// An entry built under a superseded policy revision is invalid too.
    pub fn is_outdated_profile(entry: &CacheEntry) -> bool {
        entry.profile_version != crate::probe::PROFILE_VERSION
    }

    pub fn list_all(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.store.list_cache_entries()?)
    }

    pub fn list_by_status(&self, status: CacheStatus) -> Result<Vec<CacheEntry>> {
        Ok(self.store.list_cache_by_status(status)?)
    }

    /// Startup hook: interrupted builds back to pending, leftover temp
    /// artifacts swept.
    pub fn startup_recovery(&self) -> Result<()> {
        let reset = self.store.reset_in_progress_entries()?;
        if reset > 0 {
            info!("Reset {} interrupted build(s) to pending", reset);
        }
        let swept = self.cleanup_temp_artifacts()?;
        if swept > 0 {
            info!("Swept {} temp artifact(s)", swept);
        }
        Ok(())
    }

    /// Removes `*.tmp` files and `.segments.tmp` staging dirs under the
    /// cache root.
    pub fn cleanup_temp_artifacts(&self) -> Result<usize> {
        let mut removed = 0;
        if !self.cache_root.exists() {
            return Ok(0);
        }

        for item in std::fs::read_dir(&self.cache_root)? {
            let item = item?;
            if !item.file_type()?.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(item.path())? {
                let file = file?;
                let path = file.path();
                let name = file.file_name().to_string_lossy().into_owned();

                if file.file_type()?.is_dir() && name == ".segments.tmp" {
                    std::fs::remove_dir_all(&path)?;
                    removed += 1;
                } else if file.file_type()?.is_file() && name.ends_with(".tmp") {
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Item ids come from ABS and are opaque; only path-safe characters may
/// reach the filesystem.
fn sanitize_item_id(item_id: &str) -> String {
    item_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
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
    use tempfile::TempDir;

    fn index() -> (CacheIndex, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        (CacheIndex::new(store, dir.path()), dir)
    }

    fn descriptor(dir: &TempDir) -> SourceDescriptor {
        let src = dir.path().join("source.m4b");
        std::fs::write(&src, vec![0u8; 100]).unwrap();
        SourceDescriptor::from_files(&[src]).unwrap()
    }

    #[test]
    fn create_and_claim() {
        let (index, dir) = index();
        let source = descriptor(&dir);

        assert!(index.create("item-1", &source, CacheFormat::M4a).unwrap());
        assert!(!index.create("item-1", &source, CacheFormat::M4a).unwrap());
        assert!(index.mark_in_progress("item-1").unwrap());
        assert!(!index.mark_in_progress("item-1").unwrap());
    }

    #[test]
    fn is_cached_requires_files_on_disk() {
        let (index, dir) = index();
        let source = descriptor(&dir);

        index.create("item-1", &source, CacheFormat::M4a).unwrap();
        index.mark_in_progress("item-1").unwrap();
        index
            .mark_ready("item-1", 1800.0, CacheFormat::M4a, 1, 0)
            .unwrap();

        // Ready in the index, but no artifact yet
        assert!(!index.is_cached("item-1").unwrap());

        let item_dir = index.ensure_dir("item-1").unwrap();
        std::fs::write(item_dir.join("audio.m4a"), b"data").unwrap();
        assert!(index.is_cached("item-1").unwrap());
    }

    #[test]
    fn segmented_entry_needs_every_segment() {
        let (index, dir) = index();
        let source = descriptor(&dir);

        index.create("item-1", &source, CacheFormat::M4a).unwrap();
        index.mark_in_progress("item-1").unwrap();
        index
            .mark_ready("item-1", 10_000.0, CacheFormat::M4a, 2, 7200)
            .unwrap();

        let item_dir = index.ensure_dir("item-1").unwrap();
        std::fs::write(item_dir.join("segment_000.m4a"), b"a").unwrap();
        assert!(!index.is_cached("item-1").unwrap());

        std::fs::write(item_dir.join("segment_001.m4a"), b"b").unwrap();
        assert!(index.is_cached("item-1").unwrap());
    }

    #[test]
    fn resolve_artifact_path_validates_layout() {
        let (index, dir) = index();
        let source = descriptor(&dir);
        index.create("item-1", &source, CacheFormat::M4a).unwrap();
        index.mark_in_progress("item-1").unwrap();
        index
            .mark_ready("item-1", 10_000.0, CacheFormat::M4a, 2, 7200)
            .unwrap();
        let entry = index.lookup("item-1").unwrap().unwrap();

        let path = index.resolve_artifact_path(&entry, Some(1)).unwrap();
        assert!(path.ends_with("item-1/segment_001.m4a"));

        assert!(index.resolve_artifact_path(&entry, Some(2)).is_err());
        assert!(index.resolve_artifact_path(&entry, None).is_err());
    }

    #[test]
    fn stale_detection() {
        let (index, dir) = index();
        let source = descriptor(&dir);
        index.create("item-1", &source, CacheFormat::M4a).unwrap();
        let entry = index.lookup("item-1").unwrap().unwrap();

        assert!(!CacheIndex::is_stale(&entry, source.total_size, source.mtime));
        assert!(CacheIndex::is_stale(&entry, source.total_size + 1, source.mtime));
        assert!(CacheIndex::is_stale(&entry, source.total_size, source.mtime + 1));
    }

    #[test]
    fn cleanup_sweeps_temp_files() {
        let (index, _dir) = index();

        let item_dir = index.ensure_dir("item-1").unwrap();
        std::fs::write(item_dir.join("audio.m4a.tmp"), b"partial").unwrap();
        std::fs::write(item_dir.join("audio.m4a"), b"done").unwrap();
        std::fs::create_dir_all(item_dir.join(".segments.tmp")).unwrap();

        let removed = index.cleanup_temp_artifacts().unwrap();
        assert_eq!(removed, 2);
        assert!(item_dir.join("audio.m4a").exists());
        assert!(!item_dir.join("audio.m4a.tmp").exists());
        assert!(!item_dir.join(".segments.tmp").exists());
    }

    #[test]
    fn delete_removes_artifacts() {
        let (index, dir) = index();
        let source = descriptor(&dir);
        index.create("item-1", &source, CacheFormat::M4a).unwrap();
        let item_dir = index.ensure_dir("item-1").unwrap();
        std::fs::write(item_dir.join("audio.m4a"), b"data").unwrap();

        index.delete("item-1").unwrap();
        assert!(index.lookup("item-1").unwrap().is_none());
        assert!(!item_dir.exists());
    }

    #[test]
    fn item_id_sanitized_for_filesystem() {
        assert_eq!(sanitize_item_id("li_abc-123.x"), "li_abc-123.x");
        assert_eq!(sanitize_item_id("../../etc/passwd"), ".._.._etc_passwd");
    }
}
