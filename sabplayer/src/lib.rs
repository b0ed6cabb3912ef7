//! # sabplayer - playback session orchestration
//!
//! The per-user playback state machine (start, pause/resume, seek, stop,
//! device switch, segment hand-off), the background tickers keeping the
//! renderer position and ABS progress in sync, and the HTTP routes for
//! the transport surface.

pub mod error;
pub mod orchestrator;
pub mod position;
pub mod server_ext;
pub mod ticker;

pub use error::{PlayerError, Result};
pub use orchestrator::{Orchestrator, PlaybackStatus, SeekTarget};
pub use position::{clamp_position, global_to_segment, near_segment_end, segment_to_global};
pub use server_ext::{player_router, PlayerState};
pub use ticker::spawn_tickers;
