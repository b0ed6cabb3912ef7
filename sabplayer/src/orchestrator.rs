//! Playback session orchestrator.
//!
//! Bridges global time (what ABS and the user see) with segment-local time
//! (what the renderer reports). The persisted `position_sec` is always
//! global; local positions are derived at the renderer boundary and never
//! stored.
//!
//! Mutating transport commands are serialized through one lock; the
//! background pollers read the renderer and can therefore never revert a
//! user command.

use crate::error::{PlayerError, Result};
use crate::position::{
    clamp_position, global_to_segment, near_segment_end, segment_to_global,
};
use chrono::{DateTime, Utc};
use sababs::{AbsClient, LibraryItem, ProgressUpdate};
use sabcache::{CacheFormat, CacheGate, CacheIndex};
use sabconfig::PathMapper;
use sabcontrol::{AvTransportClient, ControlError};
use sabserver::StreamTokenIssuer;
use sabstore::{new_playback_session, PlaybackSession, SonosDevice, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait between Play and the follow-up Seek; renderers drop a Seek that
/// arrives while the transport is still transitioning.
const PLAY_SEEK_DELAY: Duration = Duration::from_millis(500);
const RESUME_SEEK_DELAY: Duration = Duration::from_millis(300);

/// ABS wins a resume when it is further than this from the local record.
const ABS_POSITION_TOLERANCE_SEC: f64 = 5.0;

/// Hand off to the next segment when the renderer is this close to the
/// segment end.
const HANDOFF_MARGIN_SEC: u64 = 5;

/// End-of-track margin for the poll tick.
const END_OF_TRACK_MARGIN_SEC: u64 = 1;

#[derive(Debug, Clone)]
pub enum SeekTarget {
    Absolute(f64),
    Relative(f64),
}

/// What `/status` reports to the UI.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaybackStatus {
    pub item_id: String,
    pub sonos_uuid: String,
    pub position_sec: f64,
    pub duration_sec: f64,
    pub is_playing: bool,
    pub current_segment: u32,
    pub segment_duration_sec: u32,
    pub sleep_remaining_sec: Option<i64>,
}

pub struct Orchestrator {
    store: Arc<Store>,
    gate: CacheGate,
    abs: AbsClient,
    issuer: Arc<StreamTokenIssuer>,
    mapper: PathMapper,
    public_url: String,
    command_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        gate: CacheGate,
        abs: AbsClient,
        issuer: Arc<StreamTokenIssuer>,
        mapper: PathMapper,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gate,
            abs,
            issuer,
            mapper,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            command_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn index(&self) -> &Arc<CacheIndex> {
        self.gate.index()
    }

    // ---- public operations ----

    /// Starts playback of `item_id` on the given renderer, resuming at the
    /// position ABS has on file.
    pub async fn play(
        &self,
        session_id: &str,
        user_id: &str,
        abs_token: &str,
        item_id: &str,
        sonos_uuid: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.command_lock.lock().await;

        let detail = self.abs.item(abs_token, item_id).await?;
        let sources = self.local_sources(&detail)?;

        // Blocks until the artifact exists; at-most-one build per item is
        // enforced by the index status transition
        let entry = self.gate.ensure_cached(item_id, &sources, cancel).await?;

        let duration = entry
            .duration_sec
            .or(detail.media.duration)
            .unwrap_or(0.0);

        let global = self
            .abs
            .media_progress(abs_token, item_id)
            .await
            .ok()
            .flatten()
            .map(|p| clamp_position(p.current_time, duration))
            .unwrap_or(0.0);

        // A new play supersedes this user's previous session
        if let Some(old) = self.store.get_playback_by_session(session_id)? {
            self.silent_stop(&old).await;
            self.store.delete_playback(&old.id)?;
        }

        let token = self
            .issuer
            .generate(item_id, user_id, session_id);

        let (segment, local) = self.locate(&entry.segment_duration_sec, global);
        let url = self.stream_url(&token, &entry.cache_format, entry.is_segmented(), segment);
        let metadata = self.didl_for(item_id, &detail, &entry.cache_format, &url);

        let device = self.device(sonos_uuid)?;
        let transport = AvTransportClient::for_ip(&device.ip);
        info!(
            "▶️  Play {} on {} at {}s (segment {})",
            item_id, device.name, global as u64, segment
        );

        soap({
            let transport = transport.clone();
            let url = url.clone();
            move || transport.set_av_transport_uri(&url, &metadata)
        })
        .await?;
        soap({
            let transport = transport.clone();
            move || transport.play()
        })
        .await?;

        if local > 0 {
            tokio::time::sleep(PLAY_SEEK_DELAY).await;
            soap(move || transport.seek(local)).await?;
        }

        let ps = new_playback_session(
            uuid::Uuid::new_v4().to_string(),
            session_id,
            item_id,
            sonos_uuid,
            token,
            global,
            duration,
            segment,
            entry.segment_duration_sec,
        );
        self.store.insert_playback(&ps)?;

        Ok(())
    }

    /// Captures the renderer position, pauses, persists, and pushes one
    /// progress update to ABS.
    pub async fn pause(&self, session_id: &str, abs_token: &str) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        let mut ps = self.active_session(session_id)?;
        self.pause_session(&mut ps, Some(abs_token)).await
    }

    /// Shared pause path, also used by the sleep timer.
    pub(crate) async fn pause_session(
        &self,
        ps: &mut PlaybackSession,
        abs_token: Option<&str>,
    ) -> Result<()> {
        // Position first: after Pause some renderers report 0
        if let Err(e) = self.capture_position(ps).await {
            warn!("Position capture before pause failed: {}", e);
        }

        let transport = self.transport_for(&ps.sonos_uuid)?;
        let result = soap(move || transport.pause()).await;
        tolerate_transition(result)?;

        ps.is_playing = false;
        ps.last_position_update = sabstore::now_rfc3339();
        self.store.update_playback(ps)?;

        if let Some(token) = abs_token {
            if let Err(e) = self.push_progress(ps, token).await {
                warn!("Progress push after pause failed: {}", e);
            }
        }
        Ok(())
    }

    /// Resumes playback, optionally on a different renderer. With no
    /// device change the ABS-side position wins when it diverges by more
    /// than 5 s.
    pub async fn resume(
        &self,
        session_id: &str,
        abs_token: &str,
        new_device: Option<&str>,
    ) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        let mut ps = self.active_session(session_id)?;

        let switching = new_device.is_some_and(|d| d != ps.sonos_uuid);
        if switching {
            return self
                .switch_device(&mut ps, abs_token, new_device.unwrap_or_default())
                .await;
        }

        // Listening may have continued elsewhere; reconcile with ABS
        if let Ok(Some(progress)) = self.abs.media_progress(abs_token, &ps.item_id).await {
            if (progress.current_time - ps.position_sec).abs() > ABS_POSITION_TOLERANCE_SEC {
                debug!(
                    "ABS position {}s supersedes local {}s",
                    progress.current_time as u64, ps.position_sec as u64
                );
                ps.position_sec = clamp_position(progress.current_time, ps.duration_sec);
            }
        }

        let (segment, local) = self.locate(&ps.segment_duration_sec, ps.position_sec);
        let transport = self.transport_for(&ps.sonos_uuid)?;

        if segment != ps.current_segment {
            // The saved position crossed a segment boundary while paused
            let url = self.stream_url_for(&ps, segment)?;
            let t = transport.clone();
            soap(move || t.set_av_transport_uri(&url, "")).await?;
            ps.current_segment = segment;
        }

        let t = transport.clone();
        tolerate_transition(soap(move || t.play()).await)?;

        if local > 0 {
            tokio::time::sleep(RESUME_SEEK_DELAY).await;
            soap(move || transport.seek(local)).await?;
        }

        ps.is_playing = true;
        ps.last_position_update = sabstore::now_rfc3339();
        self.store.update_playback(&ps)?;
        Ok(())
    }

    /// Moves the session to another renderer without losing position.
    async fn switch_device(
        &self,
        ps: &mut PlaybackSession,
        abs_token: &str,
        new_uuid: &str,
    ) -> Result<()> {
        // Best effort stop on the old device; 701 and network failures are
        // both fine (it may already be stopped or gone)
        if let Ok(old_transport) = self.transport_for(&ps.sonos_uuid) {
            if let Err(e) = tolerate_transition(soap(move || old_transport.stop()).await) {
                warn!("Stop on old device {} failed: {}", ps.sonos_uuid, e);
            }
        }

        let device = self.device(new_uuid)?;
        info!("🔀 Moving session {} to {}", ps.id, device.name);

        // Token rotation on every device switch; the old token stays valid
        // until its TTL so in-flight range requests keep working
        let detail = self.abs.item(abs_token, &ps.item_id).await?;
        let entry = self
            .index()
            .lookup(&ps.item_id)?
            .ok_or_else(|| PlayerError::NotFound(ps.item_id.clone()))?;

        let user_id = self
            .store
            .get_session(&ps.session_id)?
            .map(|s| s.user_id)
            .unwrap_or_default();
        let token = self.issuer.generate(&ps.item_id, &user_id, &ps.session_id);

        let (segment, local) = self.locate(&ps.segment_duration_sec, ps.position_sec);
        let url = self.stream_url(&token, &entry.cache_format, entry.is_segmented(), segment);
        let metadata = self.didl_for(&ps.item_id, &detail, &entry.cache_format, &url);

        let transport = AvTransportClient::for_ip(&device.ip);
        let t = transport.clone();
        let u = url.clone();
        soap(move || t.set_av_transport_uri(&u, &metadata)).await?;
        let t = transport.clone();
        soap(move || t.play()).await?;

        if local > 0 {
            tokio::time::sleep(PLAY_SEEK_DELAY).await;
            soap(move || transport.seek(local)).await?;
        }

        ps.sonos_uuid = new_uuid.to_string();
        ps.stream_token = token;
        ps.current_segment = segment;
        ps.is_playing = true;
        ps.last_position_update = sabstore::now_rfc3339();
        self.store.update_playback(ps)?;
        Ok(())
    }

    /// Absolute or relative seek, clamped into the work and segment-aware.
    pub async fn seek(&self, session_id: &str, target: SeekTarget) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        let mut ps = self.active_session(session_id)?;

        let target_global = match target {
            SeekTarget::Absolute(pos) => clamp_position(pos, ps.duration_sec),
            SeekTarget::Relative(delta) => {
                clamp_position(ps.position_sec + delta, ps.duration_sec)
            }
        };

        let (target_segment, target_local) =
            self.locate(&ps.segment_duration_sec, target_global);
        let transport = self.transport_for(&ps.sonos_uuid)?;

        if target_segment == ps.current_segment {
            soap(move || transport.seek(target_local)).await?;
        } else {
            let url = self.stream_url_for(&ps, target_segment)?;
            let t = transport.clone();
            soap(move || t.set_av_transport_uri(&url, "")).await?;
            let t = transport.clone();
            soap(move || t.play()).await?;
            tokio::time::sleep(PLAY_SEEK_DELAY).await;
            if target_local > 0 {
                soap(move || transport.seek(target_local)).await?;
            }
            ps.current_segment = target_segment;
        }

        ps.position_sec = target_global;
        ps.last_position_update = sabstore::now_rfc3339();
        self.store.update_playback(&ps)?;
        Ok(())
    }

    /// Explicit stop: persist position, stop the renderer (and the
    /// UI-selected one if it differs, which covers a dangling player
    /// switch), final progress push, delete the session.
    pub async fn stop(
        &self,
        session_id: &str,
        abs_token: &str,
        ui_device: Option<&str>,
    ) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        let mut ps = self.active_session(session_id)?;

        if let Err(e) = self.capture_position(&mut ps).await {
            warn!("Position capture before stop failed: {}", e);
        }

        if let Ok(transport) = self.transport_for(&ps.sonos_uuid) {
            if let Err(e) = tolerate_transition(soap(move || transport.stop()).await) {
                warn!("Stop on {} failed: {}", ps.sonos_uuid, e);
            }
        }
        if let Some(other) = ui_device.filter(|d| *d != ps.sonos_uuid) {
            if let Ok(transport) = self.transport_for(other) {
                if let Err(e) = tolerate_transition(soap(move || transport.stop()).await) {
                    warn!("Stop on UI device {} failed: {}", other, e);
                }
            }
        }

        if let Err(e) = self.push_progress(&ps, abs_token).await {
            warn!("Final progress push failed: {}", e);
        }

        self.store.delete_playback(&ps.id)?;
        info!("⏹  Stopped session {} at {}s", ps.id, ps.position_sec as u64);
        Ok(())
    }

    /// Current state for the UI; refreshes from the renderer first.
    pub async fn status(&self, session_id: &str) -> Result<PlaybackStatus> {
        let mut ps = self.active_session(session_id)?;
        if let Err(e) = self.poll_session(&mut ps).await {
            debug!("Status poll failed, serving persisted state: {}", e);
        }
        Ok(status_view(&ps))
    }

    /// One poll tick for a session: refresh transport state and position,
    /// convert to global, hand off near a segment boundary.
    pub async fn poll_session(&self, ps: &mut PlaybackSession) -> Result<()> {
        let transport = self.transport_for(&ps.sonos_uuid)?;

        let t = transport.clone();
        let info = soap(move || t.get_transport_info()).await?;
        ps.is_playing = info.is_playing();

        let t = transport.clone();
        let position = soap(move || t.get_position_info()).await?;

        if let Some(local) = position.rel_time_sec {
            let segment_count = self.segment_count(ps)?;
            let last_segment = ps.current_segment + 1 >= segment_count;

            // End of track: only meaningful on the last (or only) segment
            if let Some(track_duration) = position.track_duration_sec {
                if last_segment
                    && track_duration > 0
                    && local + END_OF_TRACK_MARGIN_SEC >= track_duration
                {
                    debug!("Session {} reached end of track", ps.id);
                    ps.is_playing = false;
                }
            }

            let mut effective_local = local;
            if ps.is_playing
                && !last_segment
                && near_segment_end(local, ps.segment_duration_sec as u64, HANDOFF_MARGIN_SEC)
            {
                self.handoff(ps).await?;
                effective_local = 0;
            }

            let global = segment_to_global(
                ps.current_segment,
                effective_local,
                ps.segment_duration_sec as u64,
            ) as f64;
            ps.position_sec = clamp_position(global, ps.duration_sec);
            ps.last_position_update = sabstore::now_rfc3339();
        }

        self.store.update_playback(ps)?;
        Ok(())
    }

    /// Seamless advance to the next segment.
    async fn handoff(&self, ps: &mut PlaybackSession) -> Result<()> {
        let next = ps.current_segment + 1;
        info!("⏭  Segment hand-off {} → {} for {}", ps.current_segment, next, ps.item_id);

        let url = self.stream_url_for(ps, next)?;
        let transport = self.transport_for(&ps.sonos_uuid)?;

        let t = transport.clone();
        soap(move || t.set_av_transport_uri(&url, "")).await?;
        soap(move || transport.play()).await?;

        ps.current_segment = next;
        Ok(())
    }

    /// Pushes the session's global position to ABS and stamps the sync.
    pub async fn push_progress(&self, ps: &PlaybackSession, abs_token: &str) -> Result<()> {
        let update = ProgressUpdate::new(ps.position_sec, ps.duration_sec);
        self.abs
            .update_progress(abs_token, &ps.item_id, &update)
            .await?;

        let mut stamped = ps.clone();
        stamped.abs_progress_synced_at = Some(sabstore::now_rfc3339());
        self.store.update_playback(&stamped)?;
        Ok(())
    }

    // ---- sleep timer ----

    pub fn set_sleep_timer(&self, session_id: &str, minutes: u64) -> Result<DateTime<Utc>> {
        let mut ps = self.active_session(session_id)?;
        let fire_at = Utc::now() + chrono::Duration::minutes(minutes as i64);
        ps.sleep_at = Some(fire_at.to_rfc3339());
        self.store.update_playback(&ps)?;
        Ok(fire_at)
    }

    pub fn clear_sleep_timer(&self, session_id: &str) -> Result<()> {
        let mut ps = self.active_session(session_id)?;
        ps.sleep_at = None;
        self.store.update_playback(&ps)?;
        Ok(())
    }

    pub fn sleep_remaining(&self, session_id: &str) -> Result<Option<i64>> {
        let ps = self.active_session(session_id)?;
        Ok(sleep_remaining_sec(&ps))
    }

    /// Fires an expired sleep timer: pause, one final progress push, clear.
    pub(crate) async fn fire_sleep_timer(
        &self,
        ps: &mut PlaybackSession,
        abs_token: Option<&str>,
    ) -> Result<()> {
        info!("😴 Sleep timer fired for session {}", ps.id);
        self.pause_session(ps, abs_token).await?;
        ps.sleep_at = None;
        self.store.update_playback(ps)?;
        Ok(())
    }

    // ---- internals ----

    fn active_session(&self, session_id: &str) -> Result<PlaybackSession> {
        self.store
            .get_playback_by_session(session_id)?
            .ok_or(PlayerError::NoActiveSession)
    }

    fn device(&self, uuid: &str) -> Result<SonosDevice> {
        self.store
            .get_device(uuid)?
            .ok_or_else(|| PlayerError::UnknownDevice(uuid.to_string()))
    }

    fn transport_for(&self, uuid: &str) -> Result<AvTransportClient> {
        Ok(AvTransportClient::for_ip(&self.device(uuid)?.ip))
    }

    fn local_sources(&self, detail: &LibraryItem) -> Result<Vec<PathBuf>> {
        let sources: Vec<PathBuf> = detail
            .ordered_audio_files()
            .iter()
            .map(|f| self.mapper.to_local(&f.metadata.path))
            .collect();
        if sources.is_empty() {
            return Err(PlayerError::NotFound(format!(
                "{} has no audio files",
                detail.id
            )));
        }
        Ok(sources)
    }

    fn locate(&self, segment_duration_sec: &u32, global: f64) -> (u32, u64) {
        global_to_segment(global.max(0.0) as u64, *segment_duration_sec as u64)
    }

    /// Count of segments this session's artifact has, from the index when
    /// possible, derived from duration otherwise.
    fn segment_count(&self, ps: &PlaybackSession) -> Result<u32> {
        if ps.segment_duration_sec == 0 {
            return Ok(1);
        }
        if let Some(entry) = self.index().lookup(&ps.item_id)? {
            return Ok(entry.segment_count.max(1));
        }
        let derived = (ps.duration_sec / ps.segment_duration_sec as f64).ceil() as u32;
        Ok(derived.max(1))
    }

    fn stream_url(
        &self,
        token: &str,
        cache_format: &str,
        segmented: bool,
        segment: u32,
    ) -> String {
        let filename = if segmented {
            format!("segment_{:03}.{}", segment, cache_format)
        } else {
            format!("audio.{}", cache_format)
        };
        format!("{}/stream/{}/{}", self.public_url, token, filename)
    }

    fn stream_url_for(&self, ps: &PlaybackSession, segment: u32) -> Result<String> {
        let entry = self
            .index()
            .lookup(&ps.item_id)?
            .ok_or_else(|| PlayerError::NotFound(ps.item_id.clone()))?;
        Ok(self.stream_url(&ps.stream_token, &entry.cache_format, entry.is_segmented(), segment))
    }

    fn didl_for(
        &self,
        item_id: &str,
        detail: &LibraryItem,
        cache_format: &str,
        url: &str,
    ) -> String {
        let mime = CacheFormat::parse(cache_format)
            .map(|f| f.mime_type())
            .unwrap_or("application/octet-stream");
        sabdidl::audio_track_metadata(item_id, detail.title(), Some(detail.author()), url, mime)
            .unwrap_or_default()
    }

    /// Reads the renderer position and folds it into the global record.
    async fn capture_position(&self, ps: &mut PlaybackSession) -> Result<()> {
        let transport = self.transport_for(&ps.sonos_uuid)?;
        let position = soap(move || transport.get_position_info()).await?;

        if let Some(local) = position.rel_time_sec {
            let global = segment_to_global(
                ps.current_segment,
                local,
                ps.segment_duration_sec as u64,
            ) as f64;
            ps.position_sec = clamp_position(global, ps.duration_sec);
        }
        Ok(())
    }

    /// Stop used when a new play supersedes an old session; every failure
    /// is acceptable here.
    async fn silent_stop(&self, ps: &PlaybackSession) {
        if let Ok(transport) = self.transport_for(&ps.sonos_uuid) {
            let _ = tolerate_transition(soap(move || transport.stop()).await);
        }
    }
}

pub(crate) fn status_view(ps: &PlaybackSession) -> PlaybackStatus {
    PlaybackStatus {
        item_id: ps.item_id.clone(),
        sonos_uuid: ps.sonos_uuid.clone(),
        position_sec: ps.position_sec,
        duration_sec: ps.duration_sec,
        is_playing: ps.is_playing,
        current_segment: ps.current_segment,
        segment_duration_sec: ps.segment_duration_sec,
        sleep_remaining_sec: sleep_remaining_sec(ps),
    }
}

pub(crate) fn sleep_remaining_sec(ps: &PlaybackSession) -> Option<i64> {
    let sleep_at = ps.sleep_at.as_deref()?;
    let fire_at = DateTime::parse_from_rfc3339(sleep_at).ok()?;
    Some((fire_at.with_timezone(&Utc) - Utc::now()).num_seconds().max(0))
}

pub(crate) fn sleep_due(ps: &PlaybackSession) -> bool {
    ps.sleep_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .is_some_and(|t| t.with_timezone(&Utc) <= Utc::now())
}

/// UPnP error 701 means "already there"; Pause while paused, Stop while
/// stopped. Treated as success.
fn tolerate_transition(result: std::result::Result<(), ControlError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_transition_unavailable() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Blocking SOAP call on the blocking pool.
async fn soap<T, F>(f: F) -> std::result::Result<T, ControlError>
where
    F: FnOnce() -> std::result::Result<T, ControlError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ControlError::Parse(format!("SOAP task panicked: {}", e)))?
}
