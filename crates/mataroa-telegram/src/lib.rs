//! Telegram bot for the Mataroa blog.
//!
//! Lets a user create, edit, delete and list Mataroa posts from a private
//! Telegram chat. Each chat gets its own composer session that collects the
//! fields of one action and turns them into exactly one API call.
//!
//! # Environment Variables
//!
//! Required:
//! - `BOT_TOKEN`: Bot token from @BotFather (`TELEGRAM_BOT_TOKEN` also works)
//!
//! Optional:
//! - `ALLOWLIST_IDS`: Telegram user ids allowed to use the bot (default: everyone)
//! - `MATAROA_API_URL`: Posts endpoint (default: https://mataroa.blog/api/posts/)
//! - `MATAROA_HTTP_TIMEOUT_SECS`: API request timeout (default: 12)
//! - `MATAROA_PERSIST_USERS`: `0` keeps API keys in memory only
//! - `MATAROA_BOT_DIR`: Where `users.json` lives (default: ~/.config/mataroa-bot)
//!
//! # Example
//!
//! ```no_run
//! use mataroa_core::BotConfig;
//! use mataroa_telegram::MataroaBot;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BotConfig::from_env()?;
//!     let bot = MataroaBot::new(&config)?;
//!     bot.start_polling().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Commands
//!
//! - `/start [key]` - Set your Mataroa API key
//! - `/new [title | body]`, `/post` - Write a post
//! - `/update [slug]`, `/delete [slug]` - Change or remove a post
//! - `/list`, `/drafts`, `/published`, `/search <text>` - Browse posts
//! - `/confirm`, `/cancel`, `/retry` - Drive the current action
//! - `/settings`, `/status`, `/help`
//!
//! List entries carry edit, delete and publish buttons. Confirmed deletes
//! wait 15 seconds with an undo button before they are sent.

pub mod bot;
pub mod error;
pub mod handlers;
pub mod render;
pub mod session;
pub mod state;
pub mod tokens;
pub mod undo;

pub use bot::MataroaBot;
pub use error::{Result, TelegramError};
pub use session::{
    Action, ComposerSession, Field, PendingRequest, SessionError, SessionState, SessionView,
};
pub use state::{create_shared_state, BotState, CancelOutcome, SessionRegistry};
pub use tokens::SlugTokens;
pub use undo::{PendingDeletes, DELETE_GRACE};
