//! # sabcache - transcode cache engine
//!
//! Content-addressed per-item cache of renderer-compatible artifacts.
//! Sources are probed (`ffprobe`), classified against the compatibility
//! policy, and built (`ffmpeg`) by copy-through, remux or full transcode.
//! Works too long for constrained renderers to buffer are split into
//! fixed-duration segments.
//!
//! Entries move pending → in_progress → ready | failed in the persistent
//! index; that status transition is also the build lock.

pub mod error;
pub mod index;
pub mod probe;
pub mod transcoder;
pub mod warmup;
pub mod worker;

pub use error::{CacheError, Result};
pub use index::{CacheIndex, SourceDescriptor};
pub use probe::{classify, BuildStrategy, CacheFormat, Compatibility, MediaInfo, PROFILE_VERSION};
pub use transcoder::{Transcoder, DEFAULT_SEGMENT_DURATION_SEC};
pub use warmup::WarmupScheduler;
pub use worker::{BuildJob, CacheGate, CachePool, QUEUE_CAPACITY, SEGMENT_THRESHOLD_SEC};
