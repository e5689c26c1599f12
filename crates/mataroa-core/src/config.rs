//! Shared configuration for the Mataroa bot.
//!
//! Provides functions to locate the bot's data directory and to read the
//! runtime configuration from the environment.
//!
//! # Storage Structure
//!
//! All bot data is stored under `~/.config/mataroa-bot/`:
//!
//! ```text
//! ~/.config/mataroa-bot/
//! ├── .env          # Optional secrets (BOT_TOKEN, ALLOWLIST_IDS)
//! └── users.json    # API keys, per-user settings and the file allowlist
//! ```
//!
//! # Environment Variables
//!
//! - `BOT_TOKEN`: Telegram bot token (`TELEGRAM_BOT_TOKEN` is accepted too)
//! - `MATAROA_BOT_DIR`: Override the bot data directory
//! - `MATAROA_API_URL`: Override the posts API endpoint
//! - `MATAROA_HTTP_TIMEOUT_SECS`: Request timeout for API calls (default: 12)
//! - `ALLOWLIST_IDS`: Comma or space separated Telegram user ids (`ALLOWLIST` also works)
//! - `MATAROA_PERSIST_USERS`: Set to `0`/`false` to keep API keys in memory only

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Environment variable for the Telegram bot token.
pub const TOKEN_ENV: &str = "BOT_TOKEN";

/// Alternative name for the bot token.
pub const TELEGRAM_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

/// Environment variable for a custom bot directory.
pub const BOT_DIR_ENV: &str = "MATAROA_BOT_DIR";

/// Environment variable for the posts API endpoint.
pub const API_URL_ENV: &str = "MATAROA_API_URL";

/// Environment variable for the API request timeout in seconds.
pub const HTTP_TIMEOUT_ENV: &str = "MATAROA_HTTP_TIMEOUT_SECS";

/// Environment variable for the user allowlist.
pub const ALLOWLIST_ENV: &str = "ALLOWLIST_IDS";

/// Shorter allowlist variable name, checked after `ALLOWLIST_IDS`.
pub const ALLOWLIST_SHORT_ENV: &str = "ALLOWLIST";

/// Environment variable toggling persistence of user records.
pub const PERSIST_USERS_ENV: &str = "MATAROA_PERSIST_USERS";

/// Default posts API endpoint.
pub const DEFAULT_API_URL: &str = "https://mataroa.blog/api/posts/";

/// Default API request timeout.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 12;

/// Directory name under the user config directory.
const BOT_DIR_NAME: &str = "mataroa-bot";

const USERS_FILE: &str = "users.json";
const ENV_FILE: &str = ".env";

/// Errors raised while reading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No bot token in the environment.
    #[error("Telegram bot token not set. Set the BOT_TOKEN environment variable.")]
    MissingToken,

    /// The API endpoint is not an absolute http(s) URL.
    #[error("Invalid API URL '{url}': {reason}")]
    InvalidApiUrl { url: String, reason: String },

    /// The timeout is not a positive number of seconds.
    #[error("Invalid HTTP timeout '{0}': expected a positive number of seconds")]
    InvalidTimeout(String),
}

/// Get the bot data directory.
///
/// The directory is determined by:
/// 1. `MATAROA_BOT_DIR` environment variable if set
/// 2. `~/.config/mataroa-bot` if a home directory is available
/// 3. `.mataroa-bot` in the current directory as fallback
pub fn bot_dir() -> PathBuf {
    std::env::var(BOT_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".config").join(BOT_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from(format!(".{}", BOT_DIR_NAME)))
        })
}

/// Get the users file path.
///
/// Stores API keys, per-user settings and the file-based allowlist.
pub fn users_file() -> PathBuf {
    bot_dir().join(USERS_FILE)
}

/// Get the `.env` file path inside the bot directory.
pub fn env_file() -> PathBuf {
    bot_dir().join(ENV_FILE)
}

/// Ensure the bot directory exists, creating it if necessary.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_bot_dir() -> std::io::Result<()> {
    let dir = bot_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}

/// Parse a comma/whitespace separated list of Telegram user ids.
///
/// Entries that are not plain non-negative integers are ignored.
pub fn parse_allowlist(raw: &str) -> HashSet<u64> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Runtime configuration of the bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Telegram bot token.
    pub token: String,
    /// Posts API endpoint, always ending with `/`.
    pub api_url: Url,
    /// Timeout for a single API request.
    pub http_timeout: Duration,
    /// User ids allowed to talk to the bot (empty = everyone).
    pub allowlist: HashSet<u64>,
    /// Whether user records are written to `users.json`.
    pub persist_users: bool,
    /// Location of the users file.
    pub users_file: PathBuf,
}

impl BotConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let token = non_empty(TOKEN_ENV)
            .or_else(|| non_empty(TELEGRAM_TOKEN_ENV))
            .ok_or(ConfigError::MissingToken)?;

        let api_url = parse_api_url(
            non_empty(API_URL_ENV)
                .as_deref()
                .unwrap_or(DEFAULT_API_URL),
        )?;

        let http_timeout = match non_empty(HTTP_TIMEOUT_ENV) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::InvalidTimeout(raw)),
            },
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        let allowlist = non_empty(ALLOWLIST_ENV)
            .or_else(|| non_empty(ALLOWLIST_SHORT_ENV))
            .map(|raw| parse_allowlist(&raw))
            .unwrap_or_default();

        let persist_users = non_empty(PERSIST_USERS_ENV)
            .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);

        let users_file = non_empty(BOT_DIR_ENV)
            .map(|dir| PathBuf::from(dir).join(USERS_FILE))
            .unwrap_or_else(users_file);

        Ok(Self {
            token: token.trim().to_string(),
            api_url,
            http_timeout,
            allowlist,
            persist_users,
            users_file,
        })
    }
}

/// Parse and normalize the posts endpoint so relative joins keep its path.
pub fn parse_api_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };

    let url = Url::parse(&normalized).map_err(|e| ConfigError::InvalidApiUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidApiUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    Ok(url)
}
