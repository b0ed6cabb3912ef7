//! Background tickers over the active playback sessions: renderer
//! position poll, ABS progress sync, sleep-timer check. All three log and
//! continue on failure; a renderer that dropped off the network must not
//! kill the loop.

use crate::orchestrator::{sleep_due, Orchestrator};
use sabconfig::TokenCipher;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const SLEEP_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Spawns the three tickers; they run until the token fires.
pub fn spawn_tickers(
    orchestrator: Arc<Orchestrator>,
    cipher: TokenCipher,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(poll_loop(Arc::clone(&orchestrator), cancel.clone())),
        tokio::spawn(sync_loop(
            Arc::clone(&orchestrator),
            cipher.clone(),
            cancel.clone(),
        )),
        tokio::spawn(sleep_loop(orchestrator, cipher, cancel)),
    ]
}

async fn poll_loop(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let sessions = match orchestrator.store().list_playback_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Poll tick: session listing failed: {}", e);
                continue;
            }
        };

        for mut ps in sessions {
            if !ps.is_playing {
                continue;
            }
            if let Err(e) = orchestrator.poll_session(&mut ps).await {
                debug!("Poll of session {} failed: {}", ps.id, e);
            }
        }
    }
    info!("Position poller stopped");
}

async fn sync_loop(
    orchestrator: Arc<Orchestrator>,
    cipher: TokenCipher,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(SYNC_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let sessions = match orchestrator.store().list_playback_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Sync tick: session listing failed: {}", e);
                continue;
            }
        };

        for ps in sessions.into_iter().filter(|ps| ps.is_playing) {
            match abs_token_for(&orchestrator, &cipher, &ps.session_id) {
                Some(token) => {
                    if let Err(e) = orchestrator.push_progress(&ps, &token).await {
                        warn!("Progress sync for {} failed: {}", ps.item_id, e);
                    }
                }
                None => debug!("Sync tick: no usable token for session {}", ps.session_id),
            }
        }
    }
    info!("Progress syncer stopped");
}

async fn sleep_loop(
    orchestrator: Arc<Orchestrator>,
    cipher: TokenCipher,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(SLEEP_CHECK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let sessions = match orchestrator.store().list_playback_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Sleep tick: session listing failed: {}", e);
                continue;
            }
        };

        for mut ps in sessions {
            if !sleep_due(&ps) {
                continue;
            }
            let token = abs_token_for(&orchestrator, &cipher, &ps.session_id);
            if let Err(e) = orchestrator
                .fire_sleep_timer(&mut ps, token.as_deref())
                .await
            {
                warn!("Sleep timer for session {} failed: {}", ps.id, e);
            }
        }
    }
    info!("Sleep-timer checker stopped");
}

fn abs_token_for(
    orchestrator: &Orchestrator,
    cipher: &TokenCipher,
    session_id: &str,
) -> Option<String> {
    let session = orchestrator
        .store()
        .get_session(session_id)
        .ok()
        .flatten()?;
    cipher.decrypt(&session.encrypted_token).ok()
}
