//! # sabserver - HTTP shell of the bridge
//!
//! The axum server, stream-token issuer, streaming gateway (Range/206),
//! cookie auth against ABS, and the small JSON/HTML surfaces
//! (health, version, covers, cache admin). Playback routes live in
//! sabplayer and are merged into this server at startup.

pub mod api;
pub mod auth;
pub mod server;
pub mod stream;
pub mod token;

pub use api::{api_router, ApiState};
pub use auth::{auth_router, authenticate, AuthState, AuthedUser, SESSION_COOKIE};
pub use server::Server;
pub use stream::{stream_router, StreamState};
pub use token::{StreamTokenIssuer, TokenError, TokenPayload};
