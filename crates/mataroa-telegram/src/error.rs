//! Error types for the Telegram bot.

use thiserror::Error;

/// Errors that can stop the bot from starting.
#[derive(Debug, Error)]
pub enum TelegramError {
    /// Configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] mataroa_core::ConfigError),

    /// The HTTP client for the blog API could not be built.
    #[error("Failed to create Mataroa client: {0}")]
    Client(#[from] mataroa_core::ApiError),

    /// Telegram refused the token or could not be reached.
    #[error("Failed to start bot: {0}")]
    BotStartFailed(String),
}

/// Result type for Telegram operations.
pub type Result<T> = std::result::Result<T, TelegramError>;

impl From<teloxide::RequestError> for TelegramError {
    fn from(e: teloxide::RequestError) -> Self {
        TelegramError::BotStartFailed(e.to_string())
    }
}
