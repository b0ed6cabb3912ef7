//! Background warm-up: pre-builds cache entries for recently added books
//! so the first play does not wait on a transcode.

use crate::index::{CacheIndex, SourceDescriptor};
use crate::probe::CacheFormat;
use crate::worker::{BuildJob, CachePool};
use sababs::AbsClient;
use sabconfig::{PathMapper, TokenCipher};
use sabstore::{CacheStatus, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);
/// Let discovery and the HTTP server settle before the first pass.
const STABILIZATION_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_BATCH_SIZE: usize = 10;

pub struct WarmupScheduler {
    index: Arc<CacheIndex>,
    pool: CachePool,
    store: Arc<Store>,
    abs: AbsClient,
    cipher: TokenCipher,
    mapper: PathMapper,
    interval: Duration,
    batch_size: usize,
}

impl WarmupScheduler {
    pub fn new(
        index: Arc<CacheIndex>,
        pool: CachePool,
        store: Arc<Store>,
        abs: AbsClient,
        cipher: TokenCipher,
        mapper: PathMapper,
    ) -> Self {
        Self {
            index,
            pool,
            store,
            abs,
            cipher,
            mapper,
            interval: DEFAULT_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Ticker task; runs until cancelled. Pass failures are logged and the
    /// next tick retries.
    pub async fn run(self, cancel: CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(STABILIZATION_DELAY) => {}
            _ = cancel.cancelled() => return,
        }

        loop {
            match self.run_once().await {
                Ok(0) => debug!("Warm-up pass: nothing to do"),
                Ok(n) => info!("🔥 Warm-up pass queued {} build(s)", n),
                Err(e) => warn!("Warm-up pass failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// One pass. Returns the number of jobs queued.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        // Borrow the most recently active session's credentials
        let Some(token) = self.usable_token()? else {
            debug!("Warm-up: no decryptable user session");
            return Ok(0);
        };

        let libraries = self.abs.libraries(&token).await?;
        let mut queued = 0usize;

        'libraries: for library in libraries.iter().filter(|l| l.is_book_library()) {
            let items = self
                .abs
                .recent_items(&token, &library.id, self.batch_size)
                .await?;

            for item in items {
                if queued >= self.batch_size {
                    break 'libraries;
                }

                match self.consider_item(&token, &item.id).await {
                    Ok(true) => queued += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Warm-up skipped {}: {}", item.id, e),
                }
            }
        }

        Ok(queued)
    }

    fn usable_token(&self) -> anyhow::Result<Option<String>> {
        for session in self.store.list_sessions_recent()? {
            match self.cipher.decrypt(&session.encrypted_token) {
                Ok(token) => return Ok(Some(token)),
                Err(e) => {
                    debug!("Warm-up: session {} not decryptable: {}", session.session_id, e);
                }
            }
        }
        Ok(None)
    }

    /// Queues a build when the item is not cached yet. Returns `true` when
    /// a job was queued.
    async fn consider_item(&self, token: &str, item_id: &str) -> anyhow::Result<bool> {
        match self.index.lookup(item_id)? {
            Some(entry) => match entry.status {
                CacheStatus::InProgress | CacheStatus::Pending => return Ok(false),
                CacheStatus::Ready => {
                    if self.index.entry_files_exist(&entry)
                        && !CacheIndex::is_outdated_profile(&entry)
                    {
                        return Ok(false);
                    }
                    // Artifacts vanished or the policy changed: rebuild
                    self.index.delete(item_id)?;
                }
                CacheStatus::Failed => {
                    // Failed builds are retried on the next pass with a
                    // fresh entry
                    self.index.delete(item_id)?;
                }
            },
            None => {}
        }

        let detail = self.abs.item(token, item_id).await?;
        let sources: Vec<PathBuf> = detail
            .ordered_audio_files()
            .iter()
            .map(|f| self.mapper.to_local(&f.metadata.path))
            .collect();

        if sources.is_empty() {
            debug!("Warm-up: {} has no audio files", item_id);
            return Ok(false);
        }

        let source = SourceDescriptor::from_files(&sources)?;
        self.index.create(item_id, &source, CacheFormat::M4a)?;

        Ok(self.pool.enqueue(BuildJob {
            item_id: item_id.to_string(),
            sources,
        }))
    }
}
