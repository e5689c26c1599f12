//! Mataroa Telegram Bot binary.
//!
//! Start the bot with:
//! ```bash
//! BOT_TOKEN=xxx cargo run -p mataroa-telegram
//! ```

use clap::Parser;
use mataroa_core::config::{self, parse_api_url};
use mataroa_core::BotConfig;
use mataroa_telegram::MataroaBot;
use tracing_subscriber::EnvFilter;

/// Mataroa Telegram Bot - write blog posts from Telegram
#[derive(Parser, Debug)]
#[command(name = "mataroa-telegram")]
#[command(about = "Telegram bot for creating, editing and listing Mataroa blog posts")]
struct Args {
    /// Keep API keys in memory only (do not write users.json)
    #[arg(long)]
    no_persist: bool,

    /// Posts API endpoint (overrides MATAROA_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Verbose logging (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load environment variables from the bot directory first
    let env_path = config::env_file();
    if env_path.exists() {
        let _ = dotenvy::from_path(&env_path);
    }
    // Then a local .env.local or .env
    let _ = dotenvy::from_filename(".env.local").or_else(|_| dotenvy::dotenv());

    let filter = match args.verbose {
        0 => "mataroa_telegram=info,mataroa_core=info,teloxide=warn",
        1 => "mataroa_telegram=debug,mataroa_core=debug,teloxide=info",
        2 => "mataroa_telegram=trace,mataroa_core=trace,teloxide=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut bot_config = BotConfig::from_env()?;
    if let Some(url) = &args.api_url {
        bot_config.api_url = parse_api_url(url)?;
    }
    if args.no_persist {
        bot_config.persist_users = false;
    }

    if bot_config.persist_users {
        if let Err(e) = config::ensure_bot_dir() {
            tracing::warn!(error = %e, "Failed to create bot directory");
        }
    }

    let bot = MataroaBot::new(&bot_config)?;

    match bot.get_me().await {
        Ok(username) => {
            tracing::info!(username = %username, "Bot initialized successfully");
            println!("\n[robot] Mataroa Telegram Bot");
            println!("   Bot: @{}", username);
            println!("   API: {}", bot_config.api_url);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to get bot info");
            return Err(e.into());
        }
    }

    println!("\n[phone] Open Telegram and send /start to begin");
    println!("   Press Ctrl+C to stop\n");

    bot.start_polling().await?;

    Ok(())
}
