//! User records and the `users.json` store.
//!
//! File layout:
//!
//! ```json
//! {
//!   "users": {
//!     "<telegram user id>": {
//!       "api_key": "...",
//!       "settings": {
//!         "preview_length": 280,
//!         "default_publish_mode": "draft",
//!         "confirm_before_delete": true
//!       },
//!       "last_action": { "type": "delete", "slug": "old-post" }
//!     }
//!   },
//!   "allowlist": [123456789]
//! }
//! ```
//!
//! Older files that map user ids straight to records (or to bare API key
//! strings) at the top level are still accepted; they are rewritten in the
//! structured layout on the next save.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use mataroa_core::listing::effective_preview_length;
use mataroa_core::{PostRequest, DEFAULT_PREVIEW_LENGTH};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic::{atomic_write_json, read_text_optional};
use crate::error::{PersistenceError, Result};

/// Which answer the draft-or-publish question suggests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    #[default]
    Draft,
    Publish,
}

impl PublishMode {
    pub fn is_draft(self) -> bool {
        self == Self::Draft
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Draft => Self::Publish,
            Self::Publish => Self::Draft,
        }
    }
}

impl fmt::Display for PublishMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Publish => "publish",
        })
    }
}

/// Per-user preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Body characters shown per post in lists.
    #[serde(default = "default_preview_length")]
    pub preview_length: usize,
    #[serde(default)]
    pub default_publish_mode: PublishMode,
    /// Ask before deleting instead of going straight to the undo window.
    #[serde(default = "default_true")]
    pub confirm_before_delete: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            preview_length: DEFAULT_PREVIEW_LENGTH,
            default_publish_mode: PublishMode::default(),
            confirm_before_delete: true,
        }
    }
}

fn default_preview_length() -> usize {
    DEFAULT_PREVIEW_LENGTH
}

fn default_true() -> bool {
    true
}

/// What the bot remembers about one Telegram user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Mataroa API key, passed through as a bearer token.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub settings: UserSettings,
    /// Last request that failed, kept so `/retry` works after a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<PostRequest>,
}

impl UserRecord {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            settings: UserSettings::default(),
            last_action: None,
        }
    }

    /// True once the user has supplied a key.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Read one stored entry, keeping whatever parts are well-formed.
    ///
    /// A bad settings block or an unreadable `last_action` never costs the
    /// user their API key.
    fn from_entry(entry: Value) -> Self {
        let Value::Object(mut map) = entry else {
            return match entry {
                Value::String(api_key) => Self::new(api_key),
                _ => Self::new(""),
            };
        };

        let api_key = match map.remove("api_key") {
            Some(Value::String(key)) => key,
            _ => String::new(),
        };
        let mut settings: UserSettings = map
            .remove("settings")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        settings.preview_length = effective_preview_length(settings.preview_length);
        let last_action = map
            .remove("last_action")
            .and_then(|v| serde_json::from_value(v).ok());

        Self {
            api_key,
            settings,
            last_action,
        }
    }
}

/// Contents of `users.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsersFile {
    pub users: BTreeMap<u64, UserRecord>,
    /// User ids admitted in addition to the environment allowlist.
    pub allowlist: BTreeSet<u64>,
}

impl UsersFile {
    /// Interpret parsed JSON, accepting both the structured and legacy layouts.
    ///
    /// Entries with non-numeric user ids are skipped, and preview lengths
    /// outside the allowed set fall back to the default.
    pub fn from_value(value: Value) -> std::result::Result<Self, String> {
        let Value::Object(mut root) = value else {
            return Err("top level is not an object".to_string());
        };

        let (users, allowlist) = if root.contains_key("users") {
            let users = match root.remove("users") {
                Some(Value::Object(map)) => map,
                Some(Value::Null) | None => Default::default(),
                Some(_) => return Err("\"users\" is not an object".to_string()),
            };
            (users, root.remove("allowlist"))
        } else {
            (root, None)
        };

        let mut file = UsersFile::default();

        for (id, entry) in users {
            let Ok(id) = id.trim().parse::<u64>() else {
                continue;
            };
            file.users.insert(id, UserRecord::from_entry(entry));
        }

        if let Some(Value::Array(ids)) = allowlist {
            file.allowlist = ids
                .iter()
                .filter_map(|id| match id {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                })
                .collect();
        }

        Ok(file)
    }
}

/// Reads and writes `users.json`.
#[derive(Debug, Clone)]
pub struct UserStore {
    path: PathBuf,
}

impl UserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file. A missing or blank file yields an empty `UsersFile`.
    pub fn load(&self) -> Result<UsersFile> {
        let Some(text) = read_text_optional(&self.path)? else {
            return Ok(UsersFile::default());
        };
        let value: Value = serde_json::from_str(&text)?;
        UsersFile::from_value(value).map_err(|reason| PersistenceError::InvalidData {
            path: self.path.clone(),
            reason,
        })
    }

    /// Replace the file contents atomically.
    pub fn save(&self, file: &UsersFile) -> Result<()> {
        atomic_write_json(&self.path, file)
    }

    /// Save `users`, keeping whatever allowlist the file currently holds.
    ///
    /// The allowlist is only ever edited by hand, so it is re-read rather
    /// than taken from memory. An unreadable file keeps no allowlist.
    pub fn save_users(&self, users: &BTreeMap<u64, UserRecord>) -> Result<()> {
        let allowlist = self.load().map(|f| f.allowlist).unwrap_or_default();
        self.save(&UsersFile {
            users: users.clone(),
            allowlist,
        })
    }
}
