//! Mataroa Core - shared logic for the Mataroa blog bot.
//!
//! This crate holds everything that does not depend on the chat transport:
//!
//! - **api**: the `PostsApi` trait and the reqwest-backed `MataroaClient`
//! - **config**: bot directory paths and environment configuration
//! - **error**: errors returned by the blog API
//! - **listing**: filtering, search and pagination of post lists
//! - **markdown**: pass-through check of the supported Markdown subset
//! - **post**: post models and request payloads
//! - **slug**: slug validation and generation

pub mod api;
pub mod config;
pub mod error;
pub mod listing;
pub mod markdown;
pub mod post;
pub mod slug;

pub use api::{ApiOutcome, MataroaClient, PostRequest, PostsApi};
pub use config::{
    bot_dir, ensure_bot_dir, env_file, parse_allowlist, users_file, BotConfig, ConfigError,
    DEFAULT_API_URL,
};
pub use error::{ApiError, ApiResult};
pub use listing::{
    effective_preview_length, paginate, ListFilter, ListQuery, PostPage, ALLOWED_PREVIEW_LENGTHS,
    DEFAULT_PREVIEW_LENGTH, PAGE_SIZE,
};
pub use markdown::{filter_body, FilteredBody, UnsupportedSyntax};
pub use post::{NewPost, Post, PostChanges, PostReceipt};
pub use slug::{is_valid_slug, slugify, truncate};
