//! HTTP server shell: composable router, network guard, graceful
//! shutdown.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use sabutils::NetworkMatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Main server. Routers are contributed by the feature crates and merged
/// here before `start`.
pub struct Server {
    name: String,
    listen_port: u16,
    router: Arc<RwLock<Router>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            name: name.into(),
            listen_port,
            router: Arc::new(RwLock::new(Router::new())),
            join_handle: None,
        }
    }

    /// Adds a router:
    /// - a `path` starting with '/' is merged at root level,
    /// - anything else is nested under the given subpath.
    pub async fn add_router(&self, path: &str, route: Router) {
        let mut r = self.router.write().await;
        let current = std::mem::take(&mut *r);

        let combined = if path.starts_with('/') {
            current.merge(route)
        } else {
            let normalized = format!("/{}", path.trim_start_matches('/'));
            current.nest(&normalized, route)
        };

        *r = combined;
    }

    /// Restricts the whole surface (except the exempt paths) to the
    /// allowed networks.
    pub async fn guard_networks(&self, matcher: NetworkMatcher) {
        if matcher.is_empty() {
            return;
        }
        let mut r = self.router.write().await;
        let current = std::mem::take(&mut *r);
        *r = current.layer(middleware::from_fn_with_state(
            Arc::new(matcher),
            network_guard,
        ));
    }

    /// Binds and serves until the token fires (or ctrl-c).
    pub async fn start(&mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let router = self.router.read().await.clone();
        let addr = SocketAddr::from(([0, 0, 0, 0], self.listen_port));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("🌐 {} listening on {}", self.name, addr);

        let handle = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            });

            if let Err(e) = serve.await {
                warn!("HTTP server error: {}", e);
            }
        });

        self.join_handle = Some(handle);
        Ok(())
    }

    /// Waits for the serve task to finish.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

/// Paths reachable from outside the allowed networks: liveness probes and
/// the token-authenticated stream surface (renderers may sit on another
/// subnet than the browsers).
fn is_guard_exempt(path: &str) -> bool {
    path == "/health" || path == "/version" || path.starts_with("/stream/")
}

async fn network_guard(
    State(matcher): State<Arc<NetworkMatcher>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if is_guard_exempt(request.uri().path()) || matcher.allows(&addr.ip()) {
        return next.run(request).await;
    }

    warn!("Rejected {} from {}", request.uri().path(), addr.ip());
    StatusCode::FORBIDDEN.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exemptions() {
        assert!(is_guard_exempt("/health"));
        assert!(is_guard_exempt("/version"));
        assert!(is_guard_exempt("/stream/tok/audio.m4a"));
        assert!(!is_guard_exempt("/play"));
        assert!(!is_guard_exempt("/status"));
    }
}
