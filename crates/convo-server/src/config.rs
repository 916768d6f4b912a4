//! Server configuration and secrets, loaded once at boot.
//!
//! Every setting has a default so the server starts with zero configuration
//! for local development: unset gateway URLs select the in-process
//! collaborators (memory mailbox, logging push, memory search, local queue).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Names looked up in the environment when the secrets file lacks them.
const SECRET_NAMES: &[&str] = &[
    "SIGNING_SECRET",
    "MAIL_API_KEY",
    "PUSH_API_KEY",
    "SEARCH_API_KEY",
    "PLACES_API_KEY",
    "STRIPPER_API_KEY",
];

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: the platform data directory.
    pub database_path: Option<PathBuf>,

    /// Host that magic links point at.
    /// Env: `APP_HOST`
    pub app_host: String,

    /// Domain of the per-thread reply addresses.
    /// Env: `MAIL_DOMAIN`
    pub mail_domain: String,

    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Public URL prefix of stored blobs.
    /// Env: `BLOB_BASE_URL`
    pub blob_base_url: String,

    /// Maximum avatar or photo size in bytes (10 MiB).
    pub max_blob_size: usize,

    /// JSON file of secrets.
    /// Env: `SECRETS_PATH`
    pub secrets_path: Option<PathBuf>,

    /// Address of the account that owns welcome threads.
    /// Env: `SUPPORT_EMAIL`
    pub support_email: String,

    /// Where queued e-mail jobs are posted. Unset runs the queue in process.
    /// Env: `TASKS_BASE_URL`
    pub tasks_base_url: Option<String>,

    /// Env: `SEARCH_URL`
    pub search_url: Option<String>,
    /// Env: `PUSH_URL`
    pub push_url: Option<String>,
    /// Env: `MAIL_URL`
    pub mail_url: Option<String>,
    /// Env: `PLACES_URL`
    pub places_url: Option<String>,
    /// Env: `STRIPPER_URL`
    pub stripper_url: Option<String>,
    /// Fetch OpenGraph data over HTTP. Env: `LINK_PREVIEWS` (true/false)
    pub link_previews: bool,
    /// Call the OAuth providers over HTTP. Env: `OAUTH_ENABLED` (true/false)
    pub oauth_enabled: bool,

    /// Per-request deadline.
    /// Env: `REQUEST_TIMEOUT_SECS`
    /// Default: `60`
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: None,
            app_host: "localhost:8080".to_string(),
            mail_domain: "mail.localhost".to_string(),
            blob_storage_path: PathBuf::from("./blobs"),
            blob_base_url: "http://localhost:8080/blobs".to_string(),
            max_blob_size: 10 * 1024 * 1024,
            secrets_path: None,
            support_email: "support@convo.localhost".to_string(),
            tasks_base_url: None,
            search_url: None,
            push_url: None,
            mail_url: None,
            places_url: None,
            stripper_url: None,
            link_previews: true,
            oauth_enabled: true,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Ok(host) = std::env::var("APP_HOST") {
            config.app_host = host;
        }
        if let Ok(domain) = std::env::var("MAIL_DOMAIN") {
            config.mail_domain = domain;
        }
        if let Ok(path) = std::env::var("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("BLOB_BASE_URL") {
            config.blob_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(path) = std::env::var("SECRETS_PATH") {
            config.secrets_path = Some(PathBuf::from(path));
        }
        if let Ok(email) = std::env::var("SUPPORT_EMAIL") {
            config.support_email = email.trim().to_lowercase();
        }

        config.tasks_base_url = non_empty_var("TASKS_BASE_URL");
        config.search_url = non_empty_var("SEARCH_URL");
        config.push_url = non_empty_var("PUSH_URL");
        config.mail_url = non_empty_var("MAIL_URL");
        config.places_url = non_empty_var("PLACES_URL");
        config.stripper_url = non_empty_var("STRIPPER_URL");

        if let Ok(val) = std::env::var("LINK_PREVIEWS") {
            config.link_previews = val != "false" && val != "0";
        }
        if let Ok(val) = std::env::var("OAUTH_ENABLED") {
            config.oauth_enabled = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("REQUEST_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid REQUEST_TIMEOUT_SECS, using default"),
            }
        }

        config
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

/// Process-wide secrets. Read-only after boot.
#[derive(Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.values.keys().collect();
        names.sort();
        f.debug_struct("Secrets").field("names", &names).finish()
    }
}

impl Secrets {
    /// Read the JSON object at `path` (if any), then fill the names it lacks
    /// from the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut values: HashMap<String, String> = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            None => HashMap::new(),
        };
        for name in SECRET_NAMES {
            if values.contains_key(*name) {
                continue;
            }
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    values.insert(name.to_string(), value);
                }
            }
        }
        Ok(Self { values })
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Key of the magic-link signer. Without one a random key is used and
    /// every link dies with the process.
    pub fn signing_secret(&self) -> Vec<u8> {
        match self.get("SIGNING_SECRET") {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!("SIGNING_SECRET not set, using an ephemeral key (dev-only)");
                convo_shared::crypto::random_token().into_bytes()
            }
        }
    }
}
