//! Bridge configuration.
//!
//! All configuration comes from environment variables (the bridge is
//! deployed as a container). `Config::from_env()` is called once at startup
//! and the resulting struct is injected into every component that needs it;
//! there is no global configuration state.

pub mod encryption;
pub mod paths;

pub use encryption::TokenCipher;
pub use paths::PathMapper;

use anyhow::{anyhow, Context, Result};
use sabutils::NetworkMatcher;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_TOKEN_TTL_SECS: u64 = 86_400;
const MIN_SECRET_LEN: usize = 32;

/// Process configuration, fully resolved at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the Audiobookshelf server (no trailing slash).
    pub abs_url: String,
    /// Public base URL renderers use to reach the bridge (no trailing slash).
    pub public_url: String,
    /// Secret for stream-token signing and token-at-rest encryption.
    pub session_secret: String,
    pub listen_port: u16,
    pub cache_dir: PathBuf,
    pub config_dir: PathBuf,
    pub media_dir: PathBuf,
    /// Explicit `abs_prefix:local_path` mappings, in declaration order.
    pub path_mappings: Vec<(String, PathBuf)>,
    /// Default ABS-side media prefix.
    pub abs_media_prefix: String,
    /// Transcode worker count.
    pub workers: usize,
    /// Stream-token lifetime in seconds.
    pub token_ttl_secs: u64,
    /// Allowed client networks for the cookie-authenticated surface.
    pub allowed_networks: NetworkMatcher,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Lookup-driven constructor, used directly by tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key).ok_or_else(|| anyhow!("Missing required environment variable {}", key))
        };

        let abs_url = required("SAB_ABS_URL")?.trim_end_matches('/').to_string();
        let public_url = required("SAB_PUBLIC_URL")?
            .trim_end_matches('/')
            .to_string();
        let session_secret = required("SAB_SESSION_SECRET")?;
        if session_secret.len() < MIN_SECRET_LEN {
            return Err(anyhow!(
                "SAB_SESSION_SECRET must be at least {} characters",
                MIN_SECRET_LEN
            ));
        }

        let listen_port = match lookup("SAB_PORT") {
            Some(v) => v
                .parse::<u16>()
                .with_context(|| format!("Invalid SAB_PORT: {}", v))?,
            None => DEFAULT_PORT,
        };

        let workers = match lookup("SAB_WORKERS") {
            Some(v) => {
                let n = v
                    .parse::<usize>()
                    .with_context(|| format!("Invalid SAB_WORKERS: {}", v))?;
                n.max(1)
            }
            None => DEFAULT_WORKERS,
        };

        let token_ttl_secs = match lookup("SAB_TOKEN_TTL_SECS") {
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("Invalid SAB_TOKEN_TTL_SECS: {}", v))?,
            None => DEFAULT_TOKEN_TTL_SECS,
        };

        let allowed_networks = match lookup("SAB_ALLOWED_NETWORKS") {
            Some(v) => NetworkMatcher::parse(&v)
                .map_err(|e| anyhow!("Invalid SAB_ALLOWED_NETWORKS: {}", e))?,
            None => NetworkMatcher::default(),
        };

        let path_mappings = lookup("SAB_PATH_MAPPINGS")
            .map(|v| PathMapper::parse_mappings(&v))
            .unwrap_or_default();

        Ok(Self {
            abs_url,
            public_url,
            session_secret,
            listen_port,
            cache_dir: lookup("SAB_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/cache")),
            config_dir: lookup("SAB_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/config")),
            media_dir: lookup("SAB_MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/media")),
            path_mappings,
            abs_media_prefix: lookup("SAB_ABS_MEDIA_PREFIX")
                .unwrap_or_else(|| "/audiobooks".to_string()),
            workers,
            token_ttl_secs,
            allowed_networks,
        })
    }

    /// Path of the embedded database file.
    pub fn database_path(&self) -> PathBuf {
        self.config_dir.join("bridge.db")
    }

    pub fn path_mapper(&self) -> PathMapper {
        PathMapper::new(
            self.path_mappings.clone(),
            self.abs_media_prefix.clone(),
            self.media_dir.clone(),
        )
    }

    pub fn token_cipher(&self) -> Result<TokenCipher> {
        TokenCipher::new(&self.session_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("SAB_ABS_URL", "http://abs.local:13378/"),
            ("SAB_PUBLIC_URL", "http://bridge.local:8080"),
            (
                "SAB_SESSION_SECRET",
                "0123456789abcdef0123456789abcdef-extra",
            ),
        ])
    }

    fn config_from(env: &HashMap<&'static str, &'static str>) -> Result<Config> {
        Config::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn minimal_env_with_defaults() {
        let config = config_from(&base_env()).unwrap();
        assert_eq!(config.abs_url, "http://abs.local:13378");
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.workers, 2);
        assert_eq!(config.token_ttl_secs, 86_400);
        assert_eq!(config.cache_dir, PathBuf::from("/cache"));
        assert_eq!(config.database_path(), PathBuf::from("/config/bridge.db"));
        assert!(config.allowed_networks.is_empty());
    }

    #[test]
    fn missing_required_var_fails() {
        let mut env = base_env();
        env.remove("SAB_ABS_URL");
        assert!(config_from(&env).is_err());
    }

    #[test]
    fn short_secret_rejected() {
        let mut env = base_env();
        env.insert("SAB_SESSION_SECRET", "too-short");
        assert!(config_from(&env).is_err());
    }

    #[test]
    fn overrides_applied() {
        let mut env = base_env();
        env.insert("SAB_PORT", "9000");
        env.insert("SAB_WORKERS", "4");
        env.insert("SAB_TOKEN_TTL_SECS", "3600");
        env.insert("SAB_PATH_MAPPINGS", "/books:/mnt/books");
        env.insert("SAB_ALLOWED_NETWORKS", "192.168.0.0/16");
        let config = config_from(&env).unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.workers, 4);
        assert_eq!(config.token_ttl_secs, 3600);
        assert_eq!(config.path_mappings.len(), 1);
        assert!(config
            .allowed_networks
            .allows(&"192.168.4.2".parse().unwrap()));
    }

    #[test]
    fn invalid_port_rejected() {
        let mut env = base_env();
        env.insert("SAB_PORT", "not-a-port");
        assert!(config_from(&env).is_err());
    }

    #[test]
    fn workers_clamped_to_one() {
        let mut env = base_env();
        env.insert("SAB_WORKERS", "0");
        assert_eq!(config_from(&env).unwrap().workers, 1);
    }
}
