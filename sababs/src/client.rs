//! Async Audiobookshelf REST client.
//!
//! Every authenticated call takes the user's API token explicitly; the
//! client itself holds no credentials, so one instance serves all sessions.
//! Transient network failures are retried up to 3 times with linear
//! backoff; HTTP error statuses (auth, 404) are never retried.

use crate::error::{AbsError, Result};
use crate::models::*;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u64 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct AbsClient {
    base_url: String,
    http: reqwest::Client,
}

impl AbsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges credentials for a user record carrying the API token.
    pub async fn login(&self, username: &str, password: &str) -> Result<AbsUser> {
        let url = format!("{}/login", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AbsError::InvalidCredentials);
        }
        let response = Self::check_status(response, "login").await?;
        let login: LoginResponse = response.json().await?;
        debug!("ABS login ok for {}", login.user.username);
        Ok(login.user)
    }

    pub async fn libraries(&self, token: &str) -> Result<Vec<Library>> {
        let url = format!("{}/api/libraries", self.base_url);
        let response = self.get_with_retry(&url, token).await?;
        let response = Self::check_status(response, "libraries").await?;
        let parsed: LibrariesResponse = response.json().await?;
        Ok(parsed.libraries)
    }

    /// Newest items first, up to `limit`.
    pub async fn recent_items(
        &self,
        token: &str,
        library_id: &str,
        limit: usize,
    ) -> Result<Vec<LibraryItemSummary>> {
        let url = format!(
            "{}/api/libraries/{}/items?limit={}&sort=addedAt&desc=1",
            self.base_url, library_id, limit
        );
        let response = self.get_with_retry(&url, token).await?;
        let response = Self::check_status(response, library_id).await?;
        let page: LibraryItemsPage = response.json().await?;
        Ok(page.results)
    }

    /// Expanded item detail with ordered audio files.
    pub async fn item(&self, token: &str, item_id: &str) -> Result<LibraryItem> {
        let url = format!("{}/api/items/{}?expanded=1", self.base_url, item_id);
        let response = self.get_with_retry(&url, token).await?;
        let response = Self::check_status(response, item_id).await?;
        Ok(response.json().await?)
    }

    /// Saved listening position. `None` when the user never played the item.
    pub async fn media_progress(
        &self,
        token: &str,
        item_id: &str,
    ) -> Result<Option<MediaProgress>> {
        let url = format!("{}/api/me/progress/{}", self.base_url, item_id);
        let response = self.get_with_retry(&url, token).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response, item_id).await?;
        Ok(Some(response.json().await?))
    }

    pub async fn update_progress(
        &self,
        token: &str,
        item_id: &str,
        update: &ProgressUpdate,
    ) -> Result<()> {
        let url = format!("{}/api/me/progress/{}", self.base_url, item_id);
        let request = self
            .http
            .patch(&url)
            .bearer_auth(token)
            .json(update);
        let response = self.send_with_retry(request).await?;
        Self::check_status(response, item_id).await?;
        Ok(())
    }

    /// Cover image as a raw response, proxied to the browser as-is.
    pub async fn cover(&self, token: &str, item_id: &str) -> Result<reqwest::Response> {
        let url = format!("{}/api/items/{}/cover", self.base_url, item_id);
        let response = self.get_with_retry(&url, token).await?;
        Self::check_status(response, item_id).await
    }

    async fn get_with_retry(&self, url: &str, token: &str) -> Result<reqwest::Response> {
        let request = self.http.get(url).bearer_auth(token);
        self.send_with_retry(request).await
    }

    async fn send_with_retry(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let req = request
                .try_clone()
                .ok_or_else(|| AbsError::Other("request body not clonable".to_string()))?;

            match req.send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < MAX_ATTEMPTS && is_transient(&e) => {
                    warn!("ABS request failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(RETRY_BACKOFF * attempt as u32).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn check_status(
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            context.to_string()
        } else {
            format!("{}: {}", context, truncate(&body, 200))
        };
        Err(AbsError::from_status(status.as_u16(), detail))
    }
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_stripped() {
        let client = AbsClient::new("http://abs.local:13378/").unwrap();
        assert_eq!(client.base_url(), "http://abs.local:13378");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("ab", 5), "ab");
    }
}
