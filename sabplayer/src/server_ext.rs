//! Playback, discovery, volume and sleep-timer routes, merged into the
//! sabserver router at startup.

use crate::error::{PlayerError, Result};
use crate::orchestrator::{Orchestrator, SeekTarget};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use sabcontrol::{ControlError, Discovery, GroupRenderingClient, RenderingControlClient};
use sabserver::{authenticate, AuthState, AuthedUser};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct PlayerState {
    pub auth: AuthState,
    pub orchestrator: Arc<Orchestrator>,
    pub discovery: Discovery,
}

impl PlayerState {
    fn user(&self, jar: &CookieJar) -> std::result::Result<AuthedUser, StatusCode> {
        authenticate(&self.auth.store, &self.auth.cipher, jar)
    }
}

pub fn player_router(state: PlayerState) -> Router {
    Router::new()
        .route("/play", post(play))
        .route("/transport/pause", post(pause))
        .route("/transport/resume", post(resume))
        .route("/transport/stop", post(stop))
        .route("/transport/seek", post(seek))
        .route("/transport/volume", post(device_volume))
        .route("/transport/mute", post(device_mute))
        .route("/status", get(status))
        .route("/sonos/devices", get(devices))
        .route("/sonos/refresh", post(refresh))
        .route("/sonos/quick-refresh", post(quick_refresh))
        .route("/volume/group", get(group_volume).post(set_group_volume))
        .route("/volume/group/adjust", post(adjust_group_volume))
        .route(
            "/sleep-timer",
            get(get_sleep).post(set_sleep).delete(clear_sleep),
        )
        .with_state(state)
}

fn ok_json() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

// ---- playback ----

#[derive(Debug, Deserialize)]
struct PlayForm {
    item_id: String,
    sonos_uuid: String,
}

async fn play(State(state): State<PlayerState>, jar: CookieJar, Form(form): Form<PlayForm>) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };

    // Bounded by the request; dropping the connection aborts a
    // synchronous build wait
    let cancel = CancellationToken::new();
    let result = state
        .orchestrator
        .play(
            &user.session_id,
            &user.user_id,
            &user.abs_token,
            &form.item_id,
            &form.sonos_uuid,
            &cancel,
        )
        .await;

    match result {
        Ok(()) => Json(serde_json::json!({
            "redirect": format!("/player/{}", form.item_id)
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn pause(State(state): State<PlayerState>, jar: CookieJar) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    match state.orchestrator.pause(&user.session_id, &user.abs_token).await {
        Ok(()) => ok_json(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ResumeForm {
    sonos_uuid: Option<String>,
}

async fn resume(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Form(form): Form<ResumeForm>,
) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    match state
        .orchestrator
        .resume(&user.session_id, &user.abs_token, form.sonos_uuid.as_deref())
        .await
    {
        Ok(()) => ok_json(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct StopForm {
    /// Device currently selected in the UI; stopped too when it differs
    /// from the session's device.
    sonos_uuid: Option<String>,
}

async fn stop(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Form(form): Form<StopForm>,
) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    match state
        .orchestrator
        .stop(&user.session_id, &user.abs_token, form.sonos_uuid.as_deref())
        .await
    {
        Ok(()) => ok_json(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SeekForm {
    position: Option<f64>,
    relative: Option<f64>,
}

async fn seek(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Form(form): Form<SeekForm>,
) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };

    let target = match (form.position, form.relative) {
        (Some(position), _) => SeekTarget::Absolute(position),
        (None, Some(delta)) => SeekTarget::Relative(delta),
        (None, None) => {
            return (StatusCode::BAD_REQUEST, "position or relative required").into_response()
        }
    };

    match state.orchestrator.seek(&user.session_id, target).await {
        Ok(()) => ok_json(),
        Err(e) => e.into_response(),
    }
}

async fn status(State(state): State<PlayerState>, jar: CookieJar) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    match state.orchestrator.status(&user.session_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => e.into_response(),
    }
}

// ---- per-device volume / mute ----

#[derive(Debug, Deserialize)]
struct VolumeForm {
    sonos_uuid: String,
    volume: u16,
}

async fn device_volume(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Form(form): Form<VolumeForm>,
) -> Response {
    if let Err(status) = state.user(&jar) {
        return status.into_response();
    }
    match device_ip(&state, &form.sonos_uuid) {
        Ok(ip) => {
            let result =
                soap(move || RenderingControlClient::for_ip(&ip).set_volume(form.volume)).await;
            respond_soap(result)
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MuteForm {
    sonos_uuid: String,
    mute: bool,
}

async fn device_mute(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Form(form): Form<MuteForm>,
) -> Response {
    if let Err(status) = state.user(&jar) {
        return status.into_response();
    }
    match device_ip(&state, &form.sonos_uuid) {
        Ok(ip) => {
            let result =
                soap(move || RenderingControlClient::for_ip(&ip).set_mute(form.mute)).await;
            respond_soap(result)
        }
        Err(e) => e.into_response(),
    }
}

// ---- discovery ----

async fn devices(State(state): State<PlayerState>, jar: CookieJar) -> Response {
    if let Err(status) = state.user(&jar) {
        return status.into_response();
    }
    match state.auth.store.list_visible_devices() {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => {
            tracing::warn!("Device listing failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn refresh(State(state): State<PlayerState>, jar: CookieJar) -> Response {
    if let Err(status) = state.user(&jar) {
        return status.into_response();
    }
    match state.discovery.discover().await {
        Ok(found) => Json(serde_json::json!({ "found": found })).into_response(),
        Err(e) => PlayerError::Control(e).into_response(),
    }
}

async fn quick_refresh(State(state): State<PlayerState>, jar: CookieJar) -> Response {
    if let Err(status) = state.user(&jar) {
        return status.into_response();
    }
    match state.discovery.refresh_groups().await {
        Ok(()) => ok_json(),
        Err(e) => PlayerError::Control(e).into_response(),
    }
}

// ---- group volume ----

#[derive(Debug, Deserialize)]
struct GroupQuery {
    sonos_uuid: String,
}

async fn group_volume(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Query(query): Query<GroupQuery>,
) -> Response {
    if let Err(status) = state.user(&jar) {
        return status.into_response();
    }
    match device_ip(&state, &query.sonos_uuid) {
        Ok(ip) => {
            let result = soap(move || {
                let client = GroupRenderingClient::for_ip(&ip);
                let volume = client.get_group_volume()?;
                let mute = client.get_group_mute()?;
                Ok((volume, mute))
            })
            .await;
            match result {
                Ok((volume, mute)) => {
                    Json(serde_json::json!({ "volume": volume, "mute": mute })).into_response()
                }
                Err(e) => PlayerError::Control(e).into_response(),
            }
        }
        Err(e) => e.into_response(),
    }
}

async fn set_group_volume(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Form(form): Form<VolumeForm>,
) -> Response {
    if let Err(status) = state.user(&jar) {
        return status.into_response();
    }
    match device_ip(&state, &form.sonos_uuid) {
        Ok(ip) => {
            let result =
                soap(move || GroupRenderingClient::for_ip(&ip).set_group_volume(form.volume))
                    .await;
            respond_soap(result)
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AdjustForm {
    sonos_uuid: String,
    delta: i32,
}

async fn adjust_group_volume(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Form(form): Form<AdjustForm>,
) -> Response {
    if let Err(status) = state.user(&jar) {
        return status.into_response();
    }
    match device_ip(&state, &form.sonos_uuid) {
        Ok(ip) => {
            let result =
                soap(move || GroupRenderingClient::for_ip(&ip).adjust_group_volume(form.delta))
                    .await;
            match result {
                Ok(volume) => Json(serde_json::json!({ "volume": volume })).into_response(),
                Err(e) => PlayerError::Control(e).into_response(),
            }
        }
        Err(e) => e.into_response(),
    }
}

// ---- sleep timer ----

#[derive(Debug, Deserialize)]
struct SleepForm {
    minutes: u64,
}

async fn set_sleep(
    State(state): State<PlayerState>,
    jar: CookieJar,
    Form(form): Form<SleepForm>,
) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    match state.orchestrator.set_sleep_timer(&user.session_id, form.minutes) {
        Ok(fire_at) => {
            Json(serde_json::json!({ "sleep_at": fire_at.to_rfc3339() })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn clear_sleep(State(state): State<PlayerState>, jar: CookieJar) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    match state.orchestrator.clear_sleep_timer(&user.session_id) {
        Ok(()) => ok_json(),
        Err(e) => e.into_response(),
    }
}

async fn get_sleep(State(state): State<PlayerState>, jar: CookieJar) -> Response {
    let user = match state.user(&jar) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    match state.orchestrator.sleep_remaining(&user.session_id) {
        Ok(remaining) => {
            Json(serde_json::json!({ "remaining_sec": remaining })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ---- helpers ----

fn device_ip(state: &PlayerState, uuid: &str) -> Result<String> {
    state
        .auth
        .store
        .get_device(uuid)?
        .map(|d| d.ip)
        .ok_or_else(|| PlayerError::UnknownDevice(uuid.to_string()))
}

fn respond_soap(result: std::result::Result<(), ControlError>) -> Response {
    match result {
        Ok(()) => ok_json(),
        Err(e) => PlayerError::Control(e).into_response(),
    }
}

async fn soap<T, F>(f: F) -> std::result::Result<T, ControlError>
where
    F: FnOnce() -> std::result::Result<T, ControlError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ControlError::Parse(format!("SOAP task panicked: {}", e)))?
}
