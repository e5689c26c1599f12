//! Main Telegram bot implementation.

use std::sync::Arc;

use mataroa_core::{BotConfig, MataroaClient, PostsApi};
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

use crate::error::{Result, TelegramError};
use crate::handlers::{handle_callback, handle_command, handle_message, Command};
use crate::state::{create_shared_state, BotState};

/// The Telegram bot for Mataroa.
pub struct MataroaBot {
    /// The teloxide bot instance.
    bot: Bot,
    /// Shared state across handlers.
    state: Arc<BotState>,
}

impl MataroaBot {
    /// Create the bot and its Mataroa client from configuration.
    pub fn new(config: &BotConfig) -> Result<Self> {
        let client = MataroaClient::new(config.api_url.clone(), config.http_timeout)?;
        info!(
            api_url = %client.base_url(),
            timeout_secs = config.http_timeout.as_secs(),
            "Mataroa client ready"
        );

        let api: Arc<dyn PostsApi> = Arc::new(client);
        Ok(Self {
            bot: Bot::new(&config.token),
            state: create_shared_state(config, api),
        })
    }

    pub fn state(&self) -> &Arc<BotState> {
        &self.state
    }

    /// Get the bot's username.
    pub async fn get_me(&self) -> Result<String> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|e| TelegramError::BotStartFailed(e.to_string()))?;
        Ok(me.username().to_string())
    }

    /// Publish the command list shown in Telegram's command menu.
    pub async fn register_commands(&self) -> Result<()> {
        self.bot.set_my_commands(Command::bot_commands()).await?;
        Ok(())
    }

    /// Run the bot with long polling until Ctrl+C.
    ///
    /// Updates of one chat are handled in order; different chats run
    /// concurrently.
    pub async fn start_polling(&self) -> Result<()> {
        info!("Starting Telegram bot in polling mode...");

        if let Err(e) = self.register_commands().await {
            warn!(error = %e, "Could not register bot commands");
        }

        let bot = self.bot.clone();
        let state_for_commands = Arc::clone(&self.state);
        let state_for_messages = Arc::clone(&self.state);
        let state_for_callbacks = Arc::clone(&self.state);

        let handler = dptree::entry()
            .branch(
                Update::filter_callback_query()
                    .endpoint(move |bot: Bot, q: CallbackQuery| {
                        let state = Arc::clone(&state_for_callbacks);
                        async move { handle_callback(bot, q, state).await }
                    }),
            )
            .branch(
                Update::filter_message()
                    .filter_command::<Command>()
                    .endpoint(move |bot: Bot, msg: Message, cmd: Command| {
                        let state = Arc::clone(&state_for_commands);
                        info!(chat_id = %msg.chat.id, "Command matched: {:?}", cmd);
                        async move { handle_command(bot, msg, cmd, state).await }
                    }),
            )
            .branch(
                Update::filter_message()
                    .filter(|msg: Message| msg.text().map(|t| t.starts_with('/')).unwrap_or(false))
                    .endpoint(|bot: Bot, msg: Message| async move {
                        if let Some(text) = msg.text() {
                            let name = text.split_whitespace().next().unwrap_or(text);
                            info!(cmd = %name, "Unrecognized command");
                            let reply = format!(
                                "Unknown command: {}\n\nUse /help to see available commands.",
                                name
                            );
                            bot.send_message(msg.chat.id, reply).await?;
                        }
                        Ok(())
                    }),
            )
            .branch(
                Update::filter_message()
                    .filter(|msg: Message| msg.text().map(|t| !t.starts_with('/')).unwrap_or(false))
                    .endpoint(move |bot: Bot, msg: Message| {
                        let state = Arc::clone(&state_for_messages);
                        async move { handle_message(bot, msg, state).await }
                    }),
            );

        info!("Bot is running! Send /start to begin.");

        Dispatcher::builder(bot, handler)
            .default_handler(|upd| async move {
                warn!("Unhandled update: {:?}", upd.kind);
            })
            .enable_ctrlc_handler()
            .build()
            .dispatch()
            .await;

        info!("Bot stopped");
        Ok(())
    }
}
