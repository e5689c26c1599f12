//! Command, message and callback handlers for the Telegram bot.

use std::sync::Arc;
use std::time::Instant;

use mataroa_core::{
    ApiOutcome, ListFilter, ListQuery, Post, PostChanges, PostRequest, ALLOWED_PREVIEW_LENGTHS,
};
use mataroa_persistence::{PublishMode, UserSettings};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InlineKeyboardMarkup, MessageId, ParseMode};
use teloxide::utils::command::BotCommands;
use tracing::{debug, info, warn};

use crate::render::{self, html_escape, CallbackData, RowAction, SettingsChange};
use crate::session::{Action, Field, PendingRequest, SessionError, SessionState, SessionView};
use crate::state::{BotState, CancelOutcome};
use crate::undo::DELETE_GRACE;

/// Bot commands that can be invoked with /.
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "Set your Mataroa API key: /start [key]")]
    Start(String),

    #[command(description = "Show help message")]
    Help,

    #[command(description = "Write a new post: /new [title | body]")]
    New(String),

    #[command(description = "Write a new post step by step")]
    Post,

    #[command(description = "Edit a post: /update [slug]")]
    Update(String),

    #[command(description = "Delete a post: /delete [slug]")]
    Delete(String),

    #[command(description = "List posts: /list [all|published|drafts]")]
    List(String),

    #[command(description = "List drafts")]
    Drafts,

    #[command(description = "List published posts")]
    Published,

    #[command(description = "Search titles and bodies: /search <text>")]
    Search(String),

    #[command(description = "Send the prepared action")]
    Confirm,

    #[command(description = "Cancel the current action")]
    Cancel,

    #[command(description = "Try the last failed request again")]
    Retry,

    #[command(description = "Show or change settings: /settings [preview|mode|confirm] [value]")]
    Settings(String),

    #[command(description = "Show key, session and API status")]
    Status,
}

/// Send an HTML message with an optional inline keyboard.
async fn post_html(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    keyboard: Option<InlineKeyboardMarkup>,
) -> ResponseResult<Message> {
    let mut req = bot
        .send_message(chat_id, text)
        .parse_mode(ParseMode::Html);
    if let Some(kb) = keyboard {
        req = req.reply_markup(kb);
    }
    req.await
}

async fn send_html(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    keyboard: Option<InlineKeyboardMarkup>,
) -> ResponseResult<()> {
    post_html(bot, chat_id, text, keyboard).await?;
    Ok(())
}

/// Replace the text of a message sent earlier. Failures are only logged.
async fn edit_html(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: impl Into<String>,
    keyboard: Option<InlineKeyboardMarkup>,
) {
    let mut req = bot
        .edit_message_text(chat_id, message_id, text)
        .parse_mode(ParseMode::Html);
    if let Some(kb) = keyboard {
        req = req.reply_markup(kb);
    }
    if let Err(e) = req.await {
        debug!(error = %e, "Could not edit message");
    }
}

async fn send_view(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    user_id: u64,
    view: &SessionView,
) -> ResponseResult<()> {
    let mode = state.settings(user_id).await.default_publish_mode;
    send_html(
        bot,
        chat_id,
        render::session_prompt(view, mode),
        render::session_keyboard(view, mode),
    )
    .await
}

/// Report `error`; validation errors repeat the prompt they answer.
async fn send_error(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    user_id: u64,
    error: &SessionError,
) -> ResponseResult<()> {
    send_html(bot, chat_id, render::error_message(error), None).await?;
    if matches!(error, SessionError::Validation { .. }) {
        if let Some(view) = state.sessions().view(chat_id.0).await {
            send_view(bot, chat_id, state, user_id, &view).await?;
        }
    }
    Ok(())
}

/// Admit only allowlisted users in private chats. Returns the user id.
async fn gate(bot: &Bot, msg: &Message, state: &BotState) -> ResponseResult<Option<u64>> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(None);
    };
    if user.is_bot {
        return Ok(None);
    }
    if !msg.chat.is_private() {
        bot.send_message(
            msg.chat.id,
            "For your API key's safety I only work in private chats. Message me directly.",
        )
        .await?;
        return Ok(None);
    }
    if !state.is_allowed(user.id.0) {
        warn!(user_id = user.id.0, "Rejected user outside the allowlist");
        bot.send_message(msg.chat.id, "Sorry, you are not allowed to use this bot.")
            .await?;
        return Ok(None);
    }
    Ok(Some(user.id.0))
}

/// The user's API key, or a reply telling them to set one.
async fn require_api_key(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    user_id: u64,
) -> ResponseResult<Option<String>> {
    match state.api_key(user_id).await {
        Some(key) => Ok(Some(key)),
        None => {
            send_html(
                bot,
                chat_id,
                "🔑 No API key yet. Send /start and then your Mataroa API key \
                (mataroa.blog → Settings → API).",
                None,
            )
            .await?;
            Ok(None)
        }
    }
}

/// Split `/new` arguments into a title and an optional body at the first `|`.
///
/// A body without a title is ignored.
pub fn parse_new_args(args: &str) -> (Option<String>, Option<String>) {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };
    let (title, body) = match args.split_once('|') {
        Some((title, body)) => (non_empty(title), non_empty(body)),
        None => (non_empty(args), None),
    };
    match title {
        Some(title) => (Some(title), body),
        None => (None, None),
    }
}

/// A `/settings` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsRequest {
    Show,
    PreviewLength(usize),
    PublishMode(PublishMode),
    ConfirmDelete(bool),
}

impl SettingsRequest {
    fn apply(self, settings: &mut UserSettings) {
        match self {
            Self::Show => {}
            Self::PreviewLength(n) => settings.preview_length = n,
            Self::PublishMode(mode) => settings.default_publish_mode = mode,
            Self::ConfirmDelete(on) => settings.confirm_before_delete = on,
        }
    }
}

const SETTINGS_USAGE: &str =
    "Usage: /settings preview <140|280|500>, /settings mode <draft|publish> \
    or /settings confirm <on|off>";

pub fn parse_settings(args: &str) -> Result<SettingsRequest, String> {
    let mut words = args.split_whitespace();
    let (key, value) = match (words.next(), words.next(), words.next()) {
        (None, _, _) => return Ok(SettingsRequest::Show),
        (Some(key), Some(value), None) => (key.to_lowercase(), value.to_lowercase()),
        _ => return Err(SETTINGS_USAGE.to_string()),
    };

    match (key.as_str(), value.as_str()) {
        ("preview", n) => match n.parse::<usize>() {
            Ok(n) if ALLOWED_PREVIEW_LENGTHS.contains(&n) => Ok(SettingsRequest::PreviewLength(n)),
            _ => Err(format!("Preview length must be one of {}.", allowed_lengths())),
        },
        ("mode", "draft") => Ok(SettingsRequest::PublishMode(PublishMode::Draft)),
        ("mode", "publish") => Ok(SettingsRequest::PublishMode(PublishMode::Publish)),
        ("confirm", "on" | "yes") => Ok(SettingsRequest::ConfirmDelete(true)),
        ("confirm", "off" | "no") => Ok(SettingsRequest::ConfirmDelete(false)),
        _ => Err(SETTINGS_USAGE.to_string()),
    }
}

fn allowed_lengths() -> String {
    ALLOWED_PREVIEW_LENGTHS
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Handle the /start command.
pub async fn handle_start(
    bot: Bot,
    msg: Message,
    state: Arc<BotState>,
    key: String,
) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let key = key.trim();

    if key.is_empty() {
        state.expect_api_key(user_id).await;
        send_html(
            &bot,
            msg.chat.id,
            "👋 Welcome to the Mataroa bot!\n\n\
            Send me your <b>Mataroa API key</b> (mataroa.blog → Settings → API). \
            Your key is only used to call the Mataroa API on your behalf.",
            Some(render::cancel_keyboard()),
        )
        .await?;
        info!(chat_id = %msg.chat.id, "User started bot");
        return Ok(());
    }

    save_api_key(&bot, &msg, &state, user_id, key).await
}

async fn save_api_key(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    user_id: u64,
    key: &str,
) -> ResponseResult<()> {
    state.set_api_key(user_id, key).await;

    // The key should not linger in the chat history.
    if let Err(e) = bot.delete_message(msg.chat.id, msg.id).await {
        debug!(error = %e, "Could not delete message containing the API key");
    }

    let storage = if state.persists_users() {
        "It is stored on the bot's server so you stay logged in."
    } else {
        "It is kept in memory only and forgotten when the bot restarts."
    };
    send_html(
        bot,
        msg.chat.id,
        format!(
            "✅ API key saved. {}\n\nTry /new to write a post or /list to see your posts.",
            storage
        ),
        None,
    )
    .await
}

/// Handle the /help command.
pub async fn handle_help(bot: Bot, msg: Message) -> ResponseResult<()> {
    let help_text = format!(
        "{}\n\n<b>Markdown</b>: <code>*emphasis*</code>, <code>***bold italics***</code>, \
        <code>`inline code`</code> and headings <code>#</code> to <code>###</code>. \
        Anything else is sent as-is.\n\n\
        List entries have buttons to edit, delete or publish/unpublish a post. \
        Deletes can be undone for {} s.",
        html_escape(&Command::descriptions().to_string()),
        DELETE_GRACE.as_secs()
    );
    send_html(&bot, msg.chat.id, help_text, None).await
}

/// Start `action` and feed it any values given with it.
async fn begin(
    bot: &Bot,
    state: &Arc<BotState>,
    chat_id: ChatId,
    user_id: u64,
    action: Action,
    prefilled: Vec<String>,
) -> ResponseResult<()> {
    let Some(api_key) = require_api_key(bot, chat_id, state, user_id).await? else {
        return Ok(());
    };

    let mut view = match state.sessions().start(chat_id.0, action, &api_key).await {
        Ok(view) => view,
        Err(e) => return send_error(bot, chat_id, state, user_id, &e).await,
    };

    for value in prefilled {
        match state.sessions().supply(chat_id.0, &value).await {
            Ok(next) => view = next,
            Err(e) => return send_error(bot, chat_id, state, user_id, &e).await,
        }
    }

    advance(bot, state, chat_id, user_id, view).await
}

/// Move the session on after new input: fetch the post an update starts
/// from, skip the delete confirmation if the user turned it off, otherwise
/// show the next prompt.
async fn advance(
    bot: &Bot,
    state: &Arc<BotState>,
    chat_id: ChatId,
    user_id: u64,
    mut view: SessionView,
) -> ResponseResult<()> {
    if view.needs_lookup() {
        bot.send_chat_action(chat_id, ChatAction::Typing).await?;
        match state.sessions().lookup_current(chat_id.0, state.api()).await {
            Ok(next) => view = next,
            Err(SessionError::Remote(e)) => {
                return send_html(bot, chat_id, render::lookup_failed_message(&e), None).await
            }
            Err(e) => return send_error(bot, chat_id, state, user_id, &e).await,
        }
    }

    let delete_ready = view.action == Some(Action::Delete) && view.state == SessionState::Ready;
    if delete_ready && !state.settings(user_id).await.confirm_before_delete {
        return match state.sessions().detach(chat_id.0, Some(view.id)).await {
            Ok(pending) => schedule_delete(bot, state, chat_id, user_id, pending).await,
            Err(e) => send_error(bot, chat_id, state, user_id, &e).await,
        };
    }

    send_view(bot, chat_id, state, user_id, &view).await
}

/// Hold a delete back for `DELETE_GRACE` with an undo button.
async fn schedule_delete(
    bot: &Bot,
    state: &Arc<BotState>,
    chat_id: ChatId,
    user_id: u64,
    pending: PendingRequest,
) -> ResponseResult<()> {
    let PostRequest::Delete { slug } = &pending.request else {
        return send_html(bot, chat_id, "Nothing to delete.", None).await;
    };
    let slug = slug.clone();

    if state.pending_deletes().is_pending(chat_id.0, &slug).await {
        let text = format!("A delete of <code>{}</code> is already waiting.", html_escape(&slug));
        return send_html(bot, chat_id, text, None).await;
    }

    let token = state.slug_token(user_id, &slug).await;
    let notice = post_html(
        bot,
        chat_id,
        render::delete_pending_message(&slug),
        Some(render::undo_keyboard(&token)),
    )
    .await?;

    let notice_id = notice.id;
    let job = {
        let bot = bot.clone();
        let state = Arc::clone(state);
        async move {
            let text = match state.run_detached(chat_id.0, user_id, pending).await {
                Ok(outcome) => render::outcome_message(&outcome),
                Err(e) => render::error_message(&e),
            };
            edit_html(&bot, chat_id, notice_id, text, None).await;
        }
    };
    state
        .pending_deletes()
        .schedule(chat_id.0, &slug, DELETE_GRACE, job)
        .await;
    info!(chat_id = %chat_id, slug = %slug, "Delete waiting for undo window");
    Ok(())
}

/// Handle the /new command.
pub async fn handle_new(
    bot: Bot,
    msg: Message,
    state: Arc<BotState>,
    args: String,
) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let (title, body) = parse_new_args(&args);
    let prefilled = title.into_iter().chain(body).collect();
    begin(&bot, &state, msg.chat.id, user_id, Action::Create, prefilled).await
}

fn slug_arg(slug: &str) -> Vec<String> {
    Some(slug.trim().to_string())
        .filter(|s| !s.is_empty())
        .into_iter()
        .collect()
}

/// Handle the /update command.
pub async fn handle_update(
    bot: Bot,
    msg: Message,
    state: Arc<BotState>,
    slug: String,
) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };
    begin(&bot, &state, msg.chat.id, user_id, Action::Update, slug_arg(&slug)).await
}

/// Handle the /delete command.
pub async fn handle_delete(
    bot: Bot,
    msg: Message,
    state: Arc<BotState>,
    slug: String,
) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };
    begin(&bot, &state, msg.chat.id, user_id, Action::Delete, slug_arg(&slug)).await
}

/// Render `posts` for `query` and remember the query for later refreshes.
async fn list_view(
    state: &BotState,
    chat_id: ChatId,
    user_id: u64,
    posts: &[Post],
    query: ListQuery,
) -> (String, Option<InlineKeyboardMarkup>) {
    let preview = state.preview_length(user_id).await;
    let tokens = state
        .slug_tokens(user_id, posts.iter().map(|p| p.slug.as_str()))
        .await;
    let rendered = render::list_message(posts, &query, preview, &tokens);
    state.remember_list(chat_id.0, query).await;
    rendered
}

/// List posts through a List session, which is ready as soon as it starts.
async fn run_list(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    query: ListQuery,
) -> ResponseResult<()> {
    let Some(user_id) = gate(bot, msg, state).await? else {
        return Ok(());
    };
    let Some(api_key) = require_api_key(bot, msg.chat.id, state, user_id).await? else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    if let Err(e) = state.sessions().start(chat_id.0, Action::List, &api_key).await {
        return send_error(bot, chat_id, state, user_id, &e).await;
    }

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;
    match state.confirm(chat_id.0, user_id, None).await {
        Ok(ApiOutcome::Listed(posts)) => {
            let (text, keyboard) = list_view(state, chat_id, user_id, &posts, query).await;
            send_html(bot, chat_id, text, keyboard).await
        }
        Ok(other) => send_html(bot, chat_id, render::outcome_message(&other), None).await,
        Err(e) => send_error(bot, chat_id, state, user_id, &e).await,
    }
}

/// Fetch posts and show `query`, editing `message_id` in place.
async fn refresh_list(
    bot: &Bot,
    state: &BotState,
    chat_id: ChatId,
    user_id: u64,
    query: ListQuery,
    message_id: MessageId,
) -> ResponseResult<()> {
    let Some(api_key) = require_api_key(bot, chat_id, state, user_id).await? else {
        return Ok(());
    };
    match state.api().list_posts(&api_key).await {
        Ok(posts) => {
            let (text, keyboard) = list_view(state, chat_id, user_id, &posts, query).await;
            edit_html(bot, chat_id, message_id, text, keyboard).await;
            Ok(())
        }
        Err(e) => send_html(bot, chat_id, render::api_error_message(&e), None).await,
    }
}

/// Handle the /list command.
pub async fn handle_list(
    bot: Bot,
    msg: Message,
    state: Arc<BotState>,
    filter: String,
) -> ResponseResult<()> {
    match filter.parse::<ListFilter>() {
        Ok(filter) => run_list(&bot, &msg, &state, ListQuery::filtered(filter)).await,
        Err(_) => {
            send_html(
                &bot,
                msg.chat.id,
                "Usage: <code>/list [all|published|drafts]</code>",
                None,
            )
            .await
        }
    }
}

/// Handle the /search command.
pub async fn handle_search(
    bot: Bot,
    msg: Message,
    state: Arc<BotState>,
    text: String,
) -> ResponseResult<()> {
    let query = ListQuery::search(text);
    if query.search.is_none() {
        return send_html(&bot, msg.chat.id, "Usage: <code>/search &lt;text&gt;</code>", None)
            .await;
    }
    run_list(&bot, &msg, &state, query).await
}

/// Send the chat's ready session. Deletes go through the undo window.
///
/// With `session_id`, only that session is confirmed.
async fn confirm_in_chat(
    bot: &Bot,
    state: &Arc<BotState>,
    chat_id: ChatId,
    user_id: u64,
    session_id: Option<u64>,
) -> ResponseResult<()> {
    let view = state.sessions().view(chat_id.0).await;
    let delete_ready = view
        .as_ref()
        .is_some_and(|v| v.action == Some(Action::Delete) && v.state == SessionState::Ready);
    if delete_ready {
        return match state.sessions().detach(chat_id.0, session_id).await {
            Ok(pending) => schedule_delete(bot, state, chat_id, user_id, pending).await,
            Err(e) => send_error(bot, chat_id, state, user_id, &e).await,
        };
    }

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;
    match state.confirm(chat_id.0, user_id, session_id).await {
        Ok(outcome) => send_html(bot, chat_id, render::outcome_message(&outcome), None).await,
        Err(e) => send_error(bot, chat_id, state, user_id, &e).await,
    }
}

async fn cancel_in_chat(
    bot: &Bot,
    state: &BotState,
    chat_id: ChatId,
    user_id: u64,
) -> ResponseResult<()> {
    let outcome = state.cancel(chat_id.0, user_id).await;
    let was_awaiting_key = state.stop_awaiting_key(user_id).await;

    let text = match outcome {
        CancelOutcome::Cancelled(action) => format!("✖️ Cancelled the {}.", action),
        CancelOutcome::InFlight => {
            "✖️ Cancelled. The request already sent will still finish.".to_string()
        }
        CancelOutcome::NothingOpen if was_awaiting_key => "✖️ Cancelled.".to_string(),
        CancelOutcome::NothingOpen => "Nothing to cancel.".to_string(),
    };
    send_html(bot, chat_id, text, None).await
}

async fn supply_in_chat(
    bot: &Bot,
    state: &Arc<BotState>,
    chat_id: ChatId,
    user_id: u64,
    value: &str,
) -> ResponseResult<()> {
    match state.sessions().supply(chat_id.0, value).await {
        Ok(view) => advance(bot, state, chat_id, user_id, view).await,
        Err(e) => send_error(bot, chat_id, state, user_id, &e).await,
    }
}

/// Flip the publication state of a listed post, then refresh the list.
async fn toggle_publish(
    bot: &Bot,
    state: &Arc<BotState>,
    chat_id: ChatId,
    user_id: u64,
    slug: &str,
    list_message: MessageId,
) -> ResponseResult<()> {
    let Some(api_key) = require_api_key(bot, chat_id, state, user_id).await? else {
        return Ok(());
    };

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;
    let post = match state.api().get_post(&api_key, slug).await {
        Ok(post) => post,
        Err(e) => return send_html(bot, chat_id, render::lookup_failed_message(&e), None).await,
    };

    let is_draft = !post.is_draft();
    let pending = PendingRequest {
        api_key,
        request: PostRequest::Update {
            slug: slug.to_string(),
            changes: PostChanges::publication(is_draft),
        },
    };
    match state.run_detached(chat_id.0, user_id, pending).await {
        Ok(_) => {
            send_html(bot, chat_id, render::publication_message(slug, is_draft), None).await?;
            let query = state.last_list(chat_id.0).await;
            refresh_list(bot, state, chat_id, user_id, query, list_message).await
        }
        Err(e) => send_error(bot, chat_id, state, user_id, &e).await,
    }
}

/// Handle the /confirm command.
pub async fn handle_confirm(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };
    confirm_in_chat(&bot, &state, msg.chat.id, user_id, None).await
}

/// Handle the /cancel command.
pub async fn handle_cancel(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };
    cancel_in_chat(&bot, &state, msg.chat.id, user_id).await
}

/// Handle the /retry command.
pub async fn handle_retry(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;
    match state.retry(chat_id.0, user_id).await {
        Ok(ApiOutcome::Listed(posts)) => {
            let query = state.last_list(chat_id.0).await;
            let (text, keyboard) = list_view(&state, chat_id, user_id, &posts, query).await;
            send_html(&bot, chat_id, text, keyboard).await
        }
        Ok(outcome) => send_html(&bot, chat_id, render::outcome_message(&outcome), None).await,
        Err(e) => send_error(&bot, chat_id, &state, user_id, &e).await,
    }
}

/// Handle the /settings command.
pub async fn handle_settings(
    bot: Bot,
    msg: Message,
    state: Arc<BotState>,
    args: String,
) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };

    let request = match parse_settings(&args) {
        Ok(request) => request,
        Err(usage) => return send_html(&bot, msg.chat.id, html_escape(&usage), None).await,
    };

    let settings = match request {
        SettingsRequest::Show => state.settings(user_id).await,
        change => {
            let settings = state.update_settings(user_id, |s| change.apply(s)).await;
            info!(user_id, change = ?change, "Settings changed");
            settings
        }
    };

    send_html(
        &bot,
        msg.chat.id,
        render::settings_message(&settings),
        Some(render::settings_keyboard(&settings)),
    )
    .await
}

/// Handle the /status command.
pub async fn handle_status(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    let session = match state.sessions().view(chat_id.0).await {
        Some(view) if view.state.is_open() => match view.action {
            Some(action) => format!("✏️ {} in progress", action),
            None => "💤 Idle".to_string(),
        },
        _ => "💤 Idle".to_string(),
    };
    let saved_failure = state
        .user(user_id)
        .await
        .is_some_and(|u| u.last_action.is_some());
    let retry = if saved_failure || state.sessions().has_failed(chat_id.0).await {
        "\n🔁 A failed request can be retried with /retry"
    } else {
        ""
    };

    let api = match state.api_key(user_id).await {
        Some(key) => {
            bot.send_chat_action(chat_id, ChatAction::Typing).await?;
            let started = Instant::now();
            match state.api().list_posts(&key).await {
                Ok(posts) => format!(
                    "✅ Mataroa API: reachable ({} posts, {} ms)",
                    posts.len(),
                    started.elapsed().as_millis()
                ),
                Err(e) => format!("❌ Mataroa API: {}", html_escape(&e.to_string())),
            }
        }
        None => "🔑 API key: not set (send /start)".to_string(),
    };

    let text = format!(
        "📊 <b>Status</b>\n\n{}\n{}{}\n💾 Key storage: {}",
        api,
        session,
        retry,
        if state.persists_users() { "file" } else { "memory only" }
    );
    send_html(&bot, chat_id, text, None).await
}

/// Handle regular text messages (the API key, or the awaited field).
pub async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user_id) = gate(&bot, &msg, &state).await? else {
        return Ok(());
    };

    if state.is_awaiting_key(user_id).await {
        let key = text.trim();
        if key.is_empty() {
            bot.send_message(msg.chat.id, "Please send your API key.").await?;
            return Ok(());
        }
        return save_api_key(&bot, &msg, &state, user_id, key).await;
    }

    debug!(chat_id = %msg.chat.id, "Text for the composer session");
    supply_in_chat(&bot, &state, msg.chat.id, user_id, text).await
}

/// Whether a compose button still belongs to the chat's session and step.
///
/// Buttons of other kinds are always current. A session whose call is in
/// flight has no view, so its buttons are not current either.
pub fn button_is_current(view: Option<&SessionView>, data: &CallbackData) -> bool {
    let expected = match data {
        CallbackData::Confirm(id) | CallbackData::SlugSync(id) => (*id, SessionState::Ready),
        CallbackData::Draft(_, id) => (*id, SessionState::Awaiting(Field::Draft)),
        _ => return true,
    };
    view.is_some_and(|v| (v.id, v.state) == expected)
}

async fn answer(bot: &Bot, q: &CallbackQuery, text: Option<String>) -> ResponseResult<()> {
    let mut req = bot.answer_callback_query(q.id.clone());
    if let Some(text) = text {
        req = req.text(text);
    }
    if let Err(e) = req.await {
        debug!(error = %e, "Could not answer callback query");
    }
    Ok(())
}

/// Handle inline keyboard presses.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    let Some(message) = q.message.as_ref() else {
        return answer(&bot, &q, None).await;
    };
    let chat_id = message.chat().id;
    let message_id = message.id();
    let user_id = q.from.id.0;

    if !message.chat().is_private() || !state.is_allowed(user_id) {
        debug!(chat_id = %chat_id, user_id, "Ignoring callback outside an allowed private chat");
        return answer(&bot, &q, None).await;
    }

    let stale = || Some(SessionError::Stale.to_string());
    let Some(data) = q.data.as_deref().and_then(CallbackData::parse) else {
        warn!(data = ?q.data, "Unknown callback data");
        return answer(&bot, &q, stale()).await;
    };
    debug!(chat_id = %chat_id, data = ?data, "Callback");

    let view = state.sessions().view(chat_id.0).await;
    if !button_is_current(view.as_ref(), &data) {
        debug!(chat_id = %chat_id, data = ?data, "Stale compose button");
        return answer(&bot, &q, stale()).await;
    }

    let slug = match &data {
        CallbackData::Row(_, token) | CallbackData::Undo(token) => {
            match state.slug_for_token(user_id, token).await {
                Some(slug) => slug,
                None => return answer(&bot, &q, stale()).await,
            }
        }
        _ => String::new(),
    };

    if matches!(data, CallbackData::Undo(_)) {
        if !state.pending_deletes().undo(chat_id.0, &slug).await {
            let late = "Too late to undo: the delete was already sent.".to_string();
            return answer(&bot, &q, Some(late)).await;
        }
        info!(chat_id = %chat_id, slug = %slug, "Delete undone");
        edit_html(&bot, chat_id, message_id, render::undone_message(&slug), None).await;
        return answer(&bot, &q, None).await;
    }

    answer(&bot, &q, None).await?;

    match data {
        CallbackData::Confirm(id) => {
            confirm_in_chat(&bot, &state, chat_id, user_id, Some(id)).await
        }
        CallbackData::Cancel => cancel_in_chat(&bot, &state, chat_id, user_id).await,
        CallbackData::Draft(is_draft, id) => {
            let value = if is_draft { "yes" } else { "no" };
            match state
                .sessions()
                .supply_field(chat_id.0, id, Field::Draft, value)
                .await
            {
                Ok(view) => advance(&bot, &state, chat_id, user_id, view).await,
                Err(e) => send_error(&bot, chat_id, &state, user_id, &e).await,
            }
        }
        CallbackData::SlugSync(id) => match state.sessions().toggle_slug_sync(chat_id.0, id).await {
            Ok(view) => {
                let mode = state.settings(user_id).await.default_publish_mode;
                let text = render::session_prompt(&view, mode);
                edit_html(&bot, chat_id, message_id, text, render::session_keyboard(&view, mode))
                    .await;
                Ok(())
            }
            Err(e) => send_error(&bot, chat_id, &state, user_id, &e).await,
        },
        CallbackData::ListPage(filter, page) => {
            let query = ListQuery {
                filter,
                search: None,
                page,
            };
            refresh_list(&bot, &state, chat_id, user_id, query, message_id).await
        }
        CallbackData::Noop => Ok(()),
        CallbackData::Row(RowAction::Edit, _) => {
            begin(&bot, &state, chat_id, user_id, Action::Update, vec![slug]).await
        }
        CallbackData::Row(RowAction::Delete, _) => {
            begin(&bot, &state, chat_id, user_id, Action::Delete, vec![slug]).await
        }
        CallbackData::Row(RowAction::TogglePublish, _) => {
            toggle_publish(&bot, &state, chat_id, user_id, &slug, message_id).await
        }
        CallbackData::Settings(change) => {
            let settings = state
                .update_settings(user_id, |s| apply_settings_change(s, change))
                .await;
            info!(user_id, change = ?change, "Settings changed");
            edit_html(
                &bot,
                chat_id,
                message_id,
                render::settings_message(&settings),
                Some(render::settings_keyboard(&settings)),
            )
            .await;
            Ok(())
        }
        CallbackData::Undo(_) => Ok(()),
    }
}

pub fn apply_settings_change(settings: &mut UserSettings, change: SettingsChange) {
    match change {
        SettingsChange::TogglePublishMode => {
            settings.default_publish_mode = settings.default_publish_mode.toggled();
        }
        SettingsChange::ToggleConfirmDelete => {
            settings.confirm_before_delete = !settings.confirm_before_delete;
        }
        SettingsChange::PreviewLength(n) if ALLOWED_PREVIEW_LENGTHS.contains(&n) => {
            settings.preview_length = n;
        }
        SettingsChange::PreviewLength(n) => {
            debug!(preview_length = n, "Ignoring unsupported preview length");
        }
    }
}

/// Route a parsed command to its handler.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    match cmd {
        Command::Start(key) => handle_start(bot, msg, state, key).await,
        Command::Help => handle_help(bot, msg).await,
        Command::New(args) => handle_new(bot, msg, state, args).await,
        Command::Post => handle_new(bot, msg, state, String::new()).await,
        Command::Update(slug) => handle_update(bot, msg, state, slug).await,
        Command::Delete(slug) => handle_delete(bot, msg, state, slug).await,
        Command::List(filter) => handle_list(bot, msg, state, filter).await,
        Command::Drafts => {
            run_list(&bot, &msg, &state, ListQuery::filtered(ListFilter::Drafts)).await
        }
        Command::Published => {
            run_list(&bot, &msg, &state, ListQuery::filtered(ListFilter::Published)).await
        }
        Command::Search(text) => handle_search(bot, msg, state, text).await,
        Command::Confirm => handle_confirm(bot, msg, state).await,
        Command::Cancel => handle_cancel(bot, msg, state).await,
        Command::Retry => handle_retry(bot, msg, state).await,
        Command::Settings(args) => handle_settings(bot, msg, state, args).await,
        Command::Status => handle_status(bot, msg, state).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: u64, state: SessionState) -> SessionView {
        SessionView {
            id,
            action: Some(Action::Create),
            state,
            fields: Vec::new(),
            current: None,
            slug_suggestion: None,
            slug_sync: false,
        }
    }

    #[test]
    fn test_parse_new_args() {
        assert_eq!(parse_new_args(""), (None, None));
        assert_eq!(parse_new_args("  Hello "), (Some("Hello".into()), None));
        assert_eq!(
            parse_new_args("Hello | World | again"),
            (Some("Hello".into()), Some("World | again".into()))
        );
        assert_eq!(parse_new_args(" | body"), (None, None));
    }

    #[test]
    fn test_parse_settings() {
        assert_eq!(parse_settings(""), Ok(SettingsRequest::Show));
        assert_eq!(parse_settings("preview 500"), Ok(SettingsRequest::PreviewLength(500)));
        assert_eq!(
            parse_settings("mode Publish"),
            Ok(SettingsRequest::PublishMode(PublishMode::Publish))
        );
        assert_eq!(parse_settings("confirm off"), Ok(SettingsRequest::ConfirmDelete(false)));
        assert!(parse_settings("preview 1000").is_err());
        assert!(parse_settings("mode later").is_err());
        assert!(parse_settings("colour blue").is_err());
        assert!(parse_settings("preview").is_err());
    }

    #[test]
    fn test_settings_request_apply() {
        let mut settings = UserSettings::default();
        SettingsRequest::PublishMode(PublishMode::Publish).apply(&mut settings);
        SettingsRequest::ConfirmDelete(false).apply(&mut settings);
        SettingsRequest::Show.apply(&mut settings);
        assert_eq!(settings.default_publish_mode, PublishMode::Publish);
        assert!(!settings.confirm_before_delete);
    }

    #[test]
    fn test_settings_buttons() {
        let mut settings = UserSettings::default();
        apply_settings_change(&mut settings, SettingsChange::TogglePublishMode);
        apply_settings_change(&mut settings, SettingsChange::PreviewLength(140));
        apply_settings_change(&mut settings, SettingsChange::PreviewLength(141));
        apply_settings_change(&mut settings, SettingsChange::ToggleConfirmDelete);

        assert_eq!(settings.default_publish_mode, PublishMode::Publish);
        assert_eq!(settings.preview_length, 140);
        assert!(!settings.confirm_before_delete);
    }

    #[test]
    fn test_compose_buttons_only_act_on_their_session() {
        let draft_step = view(4, SessionState::Awaiting(Field::Draft));
        let ready = view(4, SessionState::Ready);

        assert!(button_is_current(Some(&draft_step), &CallbackData::Draft(true, 4)));
        assert!(button_is_current(Some(&ready), &CallbackData::Confirm(4)));

        // A newer session in the same chat.
        let title_step = view(5, SessionState::Awaiting(Field::Title));
        assert!(!button_is_current(Some(&title_step), &CallbackData::Draft(true, 4)));
        assert!(!button_is_current(Some(&title_step), &CallbackData::Confirm(4)));

        // Same session, but a different step.
        assert!(!button_is_current(Some(&ready), &CallbackData::Draft(false, 4)));
        assert!(!button_is_current(Some(&draft_step), &CallbackData::Confirm(4)));

        // No session, or one with a call in flight.
        assert!(!button_is_current(None, &CallbackData::Confirm(4)));
        assert!(button_is_current(None, &CallbackData::Cancel));
        assert!(button_is_current(None, &CallbackData::Noop));
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(
            Command::parse("/new Hello | World", "mataroa_bot").unwrap(),
            Command::New("Hello | World".into())
        );
        assert_eq!(
            Command::parse("/delete old-post", "mataroa_bot").unwrap(),
            Command::Delete("old-post".into())
        );
        assert_eq!(Command::parse("/drafts", "mataroa_bot").unwrap(), Command::Drafts);
    }
}
