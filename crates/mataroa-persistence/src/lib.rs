//! Persistence layer for the Mataroa bot.
//!
//! Stores user records (API key, settings and the last failed request)
//! plus the file-based allowlist in a single `users.json`, written
//! atomically (temp file, then rename) and readable only by the owner.
//!
//! # Example
//!
//! ```no_run
//! use mataroa_persistence::{UserRecord, UserStore};
//!
//! let store = UserStore::new("/home/user/.config/mataroa-bot/users.json");
//!
//! let mut file = store.load().unwrap();
//! file.users.insert(42, UserRecord::new("api-key"));
//! store.save(&file).unwrap();
//! ```

pub mod atomic;
pub mod error;
pub mod user_store;

pub use error::{PersistenceError, Result};
pub use user_store::{PublishMode, UserRecord, UserSettings, UserStore, UsersFile};
