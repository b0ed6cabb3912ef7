//! Cookie sessions backed by ABS credentials.
//!
//! Login exchanges ABS credentials for a `bridge_session` cookie; the ABS
//! API token is stored encrypted in the session row. A session whose token
//! no longer decrypts (secret rotation) is dropped on sight.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::post,
    Form, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use sababs::{AbsClient, AbsError};
use sabconfig::TokenCipher;
use sabstore::Store;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

pub const SESSION_COOKIE: &str = "bridge_session";

#[derive(Clone)]
pub struct AuthState {
    pub store: Arc<Store>,
    pub abs: AbsClient,
    pub cipher: TokenCipher,
}

/// A request-authenticated user with the decrypted ABS token.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub session_id: String,
    pub user_id: String,
    pub username: String,
    pub abs_token: String,
}

pub fn auth_router(state: AuthState) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .with_state(state)
}

/// Resolves the session cookie into an [`AuthedUser`]. 401 on any failure;
/// decryption failure additionally deletes the session.
pub fn authenticate(
    store: &Store,
    cipher: &TokenCipher,
    jar: &CookieJar,
) -> Result<AuthedUser, StatusCode> {
    let session_id = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let session = store
        .get_session(&session_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let abs_token = match cipher.decrypt(&session.encrypted_token) {
        Ok(token) => token,
        Err(e) => {
            warn!(
                "Dropping session {} (token decrypt failed: {})",
                session_id, e
            );
            let _ = store.delete_session(&session_id);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let _ = store.touch_session(&session_id);

    Ok(AuthedUser {
        session_id,
        user_id: session.user_id,
        username: session.username,
        abs_token,
    })
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AuthState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    let user = match state.abs.login(&form.username, &form.password).await {
        Ok(user) => user,
        Err(AbsError::InvalidCredentials) => {
            return (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response();
        }
        Err(e) => {
            warn!("ABS login failed: {}", e);
            return (StatusCode::BAD_GATEWAY, "Audiobookshelf unreachable").into_response();
        }
    };

    let encrypted = match state.cipher.encrypt(&user.token) {
        Ok(encrypted) => encrypted,
        Err(e) => {
            warn!("Token encryption failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = state
        .store
        .insert_session(&session_id, &encrypted, &user.id, &user.username)
    {
        warn!("Session insert failed: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    info!("🔑 User {} logged in", user.username);

    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::days(365))
        .build();

    (jar.add(cookie), Redirect::to("/")).into_response()
}

async fn logout(State(state): State<AuthState>, jar: CookieJar) -> Response {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        let _ = state.store.delete_session(cookie.value());
    }

    let removal = Cookie::build((SESSION_COOKIE, "")).path("/").build();
    (jar.remove(removal), Redirect::to("/login")).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (Arc<Store>, TokenCipher) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();
        (store, cipher)
    }

    fn jar_with_session(session_id: &str) -> CookieJar {
        CookieJar::new().add(Cookie::new(SESSION_COOKIE, session_id.to_string()))
    }

    #[test]
    fn authenticate_happy_path() {
        let (store, cipher) = fixtures();
        let encrypted = cipher.encrypt("abs-token").unwrap();
        store
            .insert_session("sess-1", &encrypted, "user-1", "alice")
            .unwrap();

        let user = authenticate(&store, &cipher, &jar_with_session("sess-1")).unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.abs_token, "abs-token");
    }

    #[test]
    fn missing_cookie_is_401() {
        let (store, cipher) = fixtures();
        assert_eq!(
            authenticate(&store, &cipher, &CookieJar::new()).unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn unknown_session_is_401() {
        let (store, cipher) = fixtures();
        assert_eq!(
            authenticate(&store, &cipher, &jar_with_session("nope")).unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn undecryptable_token_drops_session() {
        let (store, cipher) = fixtures();
        // Token encrypted under a different secret
        let other = TokenCipher::new("another-secret-another-secret-xx").unwrap();
        let encrypted = other.encrypt("abs-token").unwrap();
        store
            .insert_session("sess-1", &encrypted, "user-1", "alice")
            .unwrap();

        assert_eq!(
            authenticate(&store, &cipher, &jar_with_session("sess-1")).unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
        // The broken session is gone
        assert!(store.get_session("sess-1").unwrap().is_none());
    }
}
