//! Build pipeline: the bounded worker pool servicing background jobs and
//! the `ensure_cached` gate used by on-demand playback.
//!
//! At-most-one build per item is enforced by the pending→in_progress
//! transition in the store: whoever flips the row builds, everyone else
//! waits on the status.

use crate::error::{CacheError, Result};
use crate::index::{CacheIndex, SourceDescriptor};
use crate::probe::{classify, source_extension, CacheFormat, Compatibility};
use crate::transcoder::{Transcoder, DEFAULT_SEGMENT_DURATION_SEC};
use sabstore::{CacheEntry, CacheStatus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Works longer than this are split into segments.
pub const SEGMENT_THRESHOLD_SEC: f64 = DEFAULT_SEGMENT_DURATION_SEC as f64;

pub const QUEUE_CAPACITY: usize = 100;

const ENSURE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BuildJob {
    pub item_id: String,
    /// Ordered local source paths.
    pub sources: Vec<PathBuf>,
}

/// Handle on the background worker pool.
#[derive(Clone)]
pub struct CachePool {
    tx: mpsc::Sender<BuildJob>,
}

impl CachePool {
    /// Spawns `workers` tasks sharing one bounded queue.
    pub fn start(
        index: Arc<CacheIndex>,
        transcoder: Arc<Transcoder>,
        workers: usize,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|n| {
                let index = Arc::clone(&index);
                let transcoder = Arc::clone(&transcoder);
                let rx = Arc::clone(&rx);
                let cancel = cancel.clone();
                tokio::spawn(worker_loop(n, index, transcoder, rx, cancel))
            })
            .collect();

        (Self { tx }, handles)
    }

    /// Non-blocking enqueue. A full queue drops the job with a log line;
    /// callers fall back to the synchronous path or retry later.
    pub fn enqueue(&self, job: BuildJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!("Cache queue full, dropping job for {}", job.item_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!("Cache queue closed, dropping job for {}", job.item_id);
                false
            }
        }
    }
}

async fn worker_loop(
    n: usize,
    index: Arc<CacheIndex>,
    transcoder: Arc<Transcoder>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BuildJob>>>,
    cancel: CancellationToken,
) {
    info!("Cache worker {} started", n);
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = async { rx.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };

        debug!("Worker {} picked up {}", n, job.item_id);
        match process_job(&index, &transcoder, &job, &cancel).await {
            Ok(()) => {}
            Err(CacheError::Cancelled) => break,
            Err(e) => error!("Worker {} build for {} failed: {}", n, job.item_id, e),
        }
    }
    info!("Cache worker {} stopped", n);
}

/// Claims the entry and runs the build; failures are recorded on the
/// entry. A job whose entry is already ready/in_progress is a no-op.
pub async fn process_job(
    index: &CacheIndex,
    transcoder: &Transcoder,
    job: &BuildJob,
    cancel: &CancellationToken,
) -> Result<()> {
    match index.lookup(&job.item_id)? {
        None => {
            let source = SourceDescriptor::from_files(&job.sources)?;
            index.create(&job.item_id, &source, CacheFormat::M4a)?;
        }
        Some(entry) => match entry.status {
            CacheStatus::Ready | CacheStatus::InProgress => return Ok(()),
            // Failed entries are only retried through an explicit
            // delete+recreate; a queued job does not override that.
            CacheStatus::Failed => return Ok(()),
            CacheStatus::Pending => {}
        },
    }

    if !index.mark_in_progress(&job.item_id)? {
        return Ok(());
    }

    match build_item(index, transcoder, job, cancel).await {
        Ok(()) => Ok(()),
        Err(CacheError::Cancelled) => Err(CacheError::Cancelled),
        Err(e) => {
            index.mark_failed(&job.item_id, &e.to_string())?;
            Err(e)
        }
    }
}

/// The build pipeline proper. The caller has already flipped the entry to
/// in_progress.
pub async fn build_item(
    index: &CacheIndex,
    transcoder: &Transcoder,
    job: &BuildJob,
    cancel: &CancellationToken,
) -> Result<()> {
    let dir = index.ensure_dir(&job.item_id)?;

    let source = SourceDescriptor::from_files(&job.sources)?;
    transcoder.check_disk_space(&dir, source.total_size.max(0) as u64)?;

    let first = &job.sources[0];
    let info = transcoder.probe(first).await?;
    let strategy = classify(&info, &source_extension(first));

    // Sum of per-file durations decides segmentation
    let mut total_duration = info.duration_sec;
    for path in &job.sources[1..] {
        total_duration += transcoder.probe(path).await?.duration_sec;
    }

    debug!(
        "Building {}: {:?} → {} ({}s total)",
        job.item_id,
        strategy.compatibility,
        strategy.format.extension(),
        total_duration as u64
    );

    if total_duration > SEGMENT_THRESHOLD_SEC {
        build_segmented(index, transcoder, job, &dir, strategy.compatibility, strategy.format, total_duration, cancel).await
    } else {
        build_whole(index, transcoder, job, &dir, strategy.compatibility, strategy.format, total_duration, cancel).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn build_whole(
    index: &CacheIndex,
    transcoder: &Transcoder,
    job: &BuildJob,
    dir: &std::path::Path,
    compatibility: Compatibility,
    format: CacheFormat,
    total_duration: f64,
    cancel: &CancellationToken,
) -> Result<()> {
    let format = match compatibility {
        Compatibility::NeedsTranscode => CacheFormat::Mp3,
        _ => format,
    };
    let output = dir.join(format!("audio.{}", format.extension()));

    match compatibility {
        Compatibility::NeedsTranscode => {
            transcoder.transcode(&job.sources, &output, cancel).await?
        }
        _ => {
            transcoder
                .copy_remux(&job.sources, &output, format, cancel)
                .await?
        }
    }

    // The published artifact is authoritative for duration
    let duration = transcoder
        .duration(&output)
        .await
        .unwrap_or(total_duration);

    index.mark_ready(&job.item_id, duration, format, 1, 0)
}

#[allow(clippy::too_many_arguments)]
async fn build_segmented(
    index: &CacheIndex,
    transcoder: &Transcoder,
    job: &BuildJob,
    dir: &std::path::Path,
    compatibility: Compatibility,
    format: CacheFormat,
    total_duration: f64,
    cancel: &CancellationToken,
) -> Result<()> {
    let format = match compatibility {
        Compatibility::NeedsTranscode => CacheFormat::Mp3,
        _ => format,
    };

    // Multiple inputs are first concatenated into one artifact; its
    // duration is authoritative, then it gets split.
    let (split_input, duration, combined) = if job.sources.len() > 1 {
        let combined = dir.join(format!("combined.{}", format.extension()));
        match compatibility {
            Compatibility::NeedsTranscode => {
                transcoder.transcode(&job.sources, &combined, cancel).await?
            }
            _ => {
                transcoder
                    .copy_remux(&job.sources, &combined, format, cancel)
                    .await?
            }
        }
        let duration = transcoder.duration(&combined).await?;
        (combined.clone(), duration, Some(combined))
    } else {
        (job.sources[0].clone(), total_duration, None)
    };

    // A combined artifact is already in the target codec, so the split is
    // always a copy; only a single foreign-codec input re-encodes here
    let needs_encode =
        combined.is_none() && compatibility == Compatibility::NeedsTranscode;
    let result = if needs_encode {
        transcoder
            .transcode_segmented(&split_input, dir, DEFAULT_SEGMENT_DURATION_SEC, cancel)
            .await
    } else {
        transcoder
            .remux_segmented(&split_input, dir, format, DEFAULT_SEGMENT_DURATION_SEC, cancel)
            .await
    };

    if let Some(combined) = combined {
        let _ = tokio::fs::remove_file(&combined).await;
    }

    let segments = result?;
    index.mark_ready(
        &job.item_id,
        duration,
        format,
        segments.len() as u32,
        DEFAULT_SEGMENT_DURATION_SEC as u32,
    )
}

/// On-demand gate: blocks its caller until the item's artifact exists (or
/// the build fails), building synchronously when nobody else is.
#[derive(Clone)]
pub struct CacheGate {
    index: Arc<CacheIndex>,
    transcoder: Arc<Transcoder>,
}

impl CacheGate {
    pub fn new(index: Arc<CacheIndex>, transcoder: Arc<Transcoder>) -> Self {
        Self { index, transcoder }
    }

    pub fn index(&self) -> &Arc<CacheIndex> {
        &self.index
    }

    /// Resolves to a ready entry. Observing `in_progress` means some other
    /// caller is building; poll the index on a 500 ms cadence under the
    /// request's cancellation instead of starting a second build.
    pub async fn ensure_cached(
        &self,
        item_id: &str,
        sources: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<CacheEntry> {
        let source = SourceDescriptor::from_files(sources)?;
        let mut waited_on_build = false;

        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let Some(entry) = self.index.lookup(item_id)? else {
                self.index.create(item_id, &source, CacheFormat::M4a)?;
                continue;
            };

            match entry.status {
                CacheStatus::Ready => {
                    let invalid = !self.index.entry_files_exist(&entry)
                        || CacheIndex::is_stale(&entry, source.total_size, source.mtime)
                        || CacheIndex::is_outdated_profile(&entry);
                    if invalid {
                        info!("Cache entry for {} is stale, rebuilding", item_id);
                        self.index.delete(item_id)?;
                        continue;
                    }
                    return Ok(entry);
                }

                CacheStatus::InProgress => {
                    waited_on_build = true;
                    tokio::select! {
                        _ = tokio::time::sleep(ENSURE_POLL_INTERVAL) => {}
                        _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                    }
                }

                CacheStatus::Failed => {
                    if waited_on_build {
                        // The build we were waiting on just failed
                        return Err(CacheError::BuildFailed(
                            entry.error_text.unwrap_or_else(|| "unknown error".to_string()),
                        ));
                    }
                    // A previously failed entry is retried once with a
                    // fresh pending row
                    info!("Retrying failed cache entry for {}", item_id);
                    self.index.delete(item_id)?;
                }

                CacheStatus::Pending => {
                    if self.index.mark_in_progress(item_id)? {
                        let job = BuildJob {
                            item_id: item_id.to_string(),
                            sources: sources.to_vec(),
                        };
                        if let Err(e) =
                            build_item(&self.index, &self.transcoder, &job, cancel).await
                        {
                            if !matches!(e, CacheError::Cancelled) {
                                self.index.mark_failed(item_id, &e.to_string())?;
                            }
                            return Err(e);
                        }
                    }
                    // Lost the claim: fall through to the wait loop
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sabstore::Store;
    use tempfile::TempDir;

    fn setup() -> (Arc<CacheIndex>, CacheGate, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let index = Arc::new(CacheIndex::new(store, dir.path().join("cache")));
        let gate = CacheGate::new(Arc::clone(&index), Arc::new(Transcoder::default()));
        (index, gate, dir)
    }

    fn write_source(dir: &TempDir) -> PathBuf {
        let src = dir.path().join("book.m4b");
        std::fs::write(&src, vec![0u8; 64]).unwrap();
        src
    }

    fn make_ready(index: &CacheIndex, item_id: &str, src: &PathBuf) {
        let source = SourceDescriptor::from_files(std::slice::from_ref(src)).unwrap();
        index.create(item_id, &source, CacheFormat::M4a).unwrap();
        index.mark_in_progress(item_id).unwrap();
        index
            .mark_ready(item_id, 1800.0, CacheFormat::M4a, 1, 0)
            .unwrap();
        let item_dir = index.ensure_dir(item_id).unwrap();
        std::fs::write(item_dir.join("audio.m4a"), b"artifact").unwrap();
    }

    #[tokio::test]
    async fn ensure_cached_returns_ready_entry_without_building() {
        let (index, gate, dir) = setup();
        let src = write_source(&dir);
        make_ready(&index, "item-1", &src);

        let cancel = CancellationToken::new();
        let entry = gate
            .ensure_cached("item-1", &[src], &cancel)
            .await
            .unwrap();
        assert_eq!(entry.status, CacheStatus::Ready);
    }

    #[tokio::test]
    async fn ensure_cached_waits_for_other_builder() {
        let (index, gate, dir) = setup();
        let src = write_source(&dir);

        // Another worker owns the build
        let source = SourceDescriptor::from_files(std::slice::from_ref(&src)).unwrap();
        index.create("item-1", &source, CacheFormat::M4a).unwrap();
        index.mark_in_progress("item-1").unwrap();

        let finisher = {
            let index = Arc::clone(&index);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                index
                    .mark_ready("item-1", 1800.0, CacheFormat::M4a, 1, 0)
                    .unwrap();
                let dir = index.ensure_dir("item-1").unwrap();
                std::fs::write(dir.join("audio.m4a"), b"artifact").unwrap();
            })
        };

        let cancel = CancellationToken::new();
        let entry = gate
            .ensure_cached("item-1", &[src], &cancel)
            .await
            .unwrap();
        assert_eq!(entry.status, CacheStatus::Ready);
        finisher.await.unwrap();
    }

    #[tokio::test]
    async fn ensure_cached_surfaces_watched_build_failure() {
        let (index, gate, dir) = setup();
        let src = write_source(&dir);

        let source = SourceDescriptor::from_files(std::slice::from_ref(&src)).unwrap();
        index.create("item-1", &source, CacheFormat::M4a).unwrap();
        index.mark_in_progress("item-1").unwrap();

        {
            let index = Arc::clone(&index);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                index.mark_failed("item-1", "ffmpeg exited 1").unwrap();
            });
        }

        let cancel = CancellationToken::new();
        let err = gate
            .ensure_cached("item-1", &[src], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::BuildFailed(msg) if msg.contains("ffmpeg exited 1")));
    }

    #[tokio::test]
    async fn ensure_cached_honors_cancellation() {
        let (index, gate, dir) = setup();
        let src = write_source(&dir);

        let source = SourceDescriptor::from_files(std::slice::from_ref(&src)).unwrap();
        index.create("item-1", &source, CacheFormat::M4a).unwrap();
        index.mark_in_progress("item-1").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gate
            .ensure_cached("item-1", &[src], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
    }

    #[tokio::test]
    async fn ensure_cached_rebuild_on_stale_source_fails_without_tool() {
        let (index, gate, dir) = setup();
        let src = write_source(&dir);
        make_ready(&index, "item-1", &src);

        // Source grows: the ready entry is stale, a rebuild starts and
        // fails in this environment (no real media file / tool output)
        std::fs::write(&src, vec![0u8; 128]).unwrap();

        let cancel = CancellationToken::new();
        let result = gate.ensure_cached("item-1", &[src], &cancel).await;
        assert!(result.is_err());

        // The stale ready entry is gone either way
        let entry = index.lookup("item-1").unwrap();
        assert!(entry.is_none_or(|e| e.status != CacheStatus::Ready));
    }

    #[tokio::test]
    async fn queue_drops_when_full() {
        // No workers draining: hold the receiver so the channel stays open
        let (tx, _rx) = mpsc::channel(QUEUE_CAPACITY);
        let pool = CachePool { tx };

        let mut accepted = 0;
        for i in 0..(QUEUE_CAPACITY + 10) {
            if pool.enqueue(BuildJob {
                item_id: format!("item-{}", i),
                sources: vec![PathBuf::from("/tmp/x.m4b")],
            }) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn process_job_skips_ready_and_in_progress() {
        let (index, _gate, dir) = setup();
        let src = write_source(&dir);
        make_ready(&index, "item-1", &src);

        let transcoder = Transcoder::default();
        let cancel = CancellationToken::new();
        let job = BuildJob {
            item_id: "item-1".to_string(),
            sources: vec![src],
        };
        // Ready entry: a no-op, no tool invoked
        process_job(&index, &transcoder, &job, &cancel).await.unwrap();
        assert_eq!(
            index.lookup("item-1").unwrap().unwrap().status,
            CacheStatus::Ready
        );
    }

    #[tokio::test]
    async fn failed_build_is_recorded_on_entry() {
        let (index, _gate, dir) = setup();
        let src = write_source(&dir);

        let transcoder = Transcoder::default();
        let cancel = CancellationToken::new();
        let job = BuildJob {
            item_id: "item-1".to_string(),
            sources: vec![src],
        };

        // The source is 64 zero bytes: either ffprobe rejects it or the
        // tool is missing; both must leave a failed entry with a reason
        let result = process_job(&index, &transcoder, &job, &cancel).await;
        assert!(result.is_err());

        let entry = index.lookup("item-1").unwrap().unwrap();
        assert_eq!(entry.status, CacheStatus::Failed);
        assert!(entry.error_text.is_some());
    }
}
