//! Message texts and inline keyboards.
//!
//! Everything here produces Telegram HTML. User-supplied text is always
//! escaped before it is embedded.

use std::collections::HashMap;

use mataroa_core::{
    filter_body, paginate, truncate, ApiError, ApiOutcome, ListFilter, ListQuery, Post, PostPage,
    ALLOWED_PREVIEW_LENGTHS,
};
use mataroa_persistence::{PublishMode, UserSettings};
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::session::{Action, Field, SessionError, SessionState, SessionView};
use crate::undo::DELETE_GRACE;

/// Longest preview message, safely below Telegram's 4096 limit.
pub const PREVIEW_MAX_CHARS: usize = 3900;

/// Longest escaped title shown in a preview or prompt.
const TITLE_MAX_CHARS: usize = 300;

/// Body characters of the current post shown when an update starts.
const CURRENT_BODY_CHARS: usize = 500;

/// Escape HTML special characters for Telegram HTML mode.
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escape `text`, stopping before the escaped form exceeds `max_chars`.
fn escape_within(text: &str, max_chars: usize) -> String {
    let escaped = html_escape(text);
    if escaped.chars().count() <= max_chars {
        return escaped;
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let piece = html_escape(ch.encode_utf8(&mut [0; 4]));
        let len = piece.chars().count();
        if used + len + 1 > max_chars {
            break;
        }
        out.push_str(&piece);
        used += len;
    }
    out.push('…');
    out
}

/// What a list-row button does to its post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Edit,
    Delete,
    TogglePublish,
}

/// A settings button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    TogglePublishMode,
    ToggleConfirmDelete,
    PreviewLength(usize),
}

/// Parsed `callback_data` of the bot's inline buttons.
///
/// Compose buttons carry the id of the session that showed them. Post
/// buttons carry a slug token (see `SlugTokens`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackData {
    Confirm(u64),
    Cancel,
    /// Answer for the draft flag; `true` keeps the post as a draft.
    Draft(bool, u64),
    SlugSync(u64),
    ListPage(ListFilter, usize),
    /// Page indicator; does nothing.
    Noop,
    Row(RowAction, String),
    Undo(String),
    Settings(SettingsChange),
}

impl CallbackData {
    pub fn parse(data: &str) -> Option<Self> {
        let mut parts = data.split(':');
        let parsed = match (parts.next()?, parts.next(), parts.next()) {
            ("compose", Some("confirm"), Some(id)) => Self::Confirm(id.parse().ok()?),
            ("compose", Some("cancel"), None) => Self::Cancel,
            ("compose", Some("slugsync"), Some(id)) => Self::SlugSync(id.parse().ok()?),
            ("draft", Some("yes"), Some(id)) => Self::Draft(true, id.parse().ok()?),
            ("draft", Some("no"), Some(id)) => Self::Draft(false, id.parse().ok()?),
            ("list", Some("noop"), None) => Self::Noop,
            ("list", Some(filter), Some(page)) => {
                Self::ListPage(filter.parse().ok()?, page.parse().ok()?)
            }
            ("post", Some(action), Some(token)) if !token.is_empty() => {
                let action = match action {
                    "edit" => RowAction::Edit,
                    "delete" => RowAction::Delete,
                    "publish" => RowAction::TogglePublish,
                    _ => return None,
                };
                Self::Row(action, token.to_string())
            }
            ("undo", Some(token), None) if !token.is_empty() => Self::Undo(token.to_string()),
            ("settings", Some("mode"), None) => Self::Settings(SettingsChange::TogglePublishMode),
            ("settings", Some("confirm"), None) => {
                Self::Settings(SettingsChange::ToggleConfirmDelete)
            }
            ("settings", Some("preview"), Some(n)) => {
                Self::Settings(SettingsChange::PreviewLength(n.parse().ok()?))
            }
            _ => return None,
        };
        parts.next().is_none().then_some(parsed)
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Confirm(id) => format!("compose:confirm:{}", id),
            Self::Cancel => "compose:cancel".to_string(),
            Self::SlugSync(id) => format!("compose:slugsync:{}", id),
            Self::Draft(true, id) => format!("draft:yes:{}", id),
            Self::Draft(false, id) => format!("draft:no:{}", id),
            Self::ListPage(filter, page) => format!("list:{}:{}", filter, page),
            Self::Noop => "list:noop".to_string(),
            Self::Row(action, token) => {
                let action = match action {
                    RowAction::Edit => "edit",
                    RowAction::Delete => "delete",
                    RowAction::TogglePublish => "publish",
                };
                format!("post:{}:{}", action, token)
            }
            Self::Undo(token) => format!("undo:{}", token),
            Self::Settings(SettingsChange::TogglePublishMode) => "settings:mode".to_string(),
            Self::Settings(SettingsChange::ToggleConfirmDelete) => "settings:confirm".to_string(),
            Self::Settings(SettingsChange::PreviewLength(n)) => format!("settings:preview:{}", n),
        }
    }
}

fn button(text: impl Into<String>, data: CallbackData) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text, data.encode())
}

fn checked(label: &str, on: bool) -> String {
    if on {
        format!("{} ✓", label)
    } else {
        label.to_string()
    }
}

pub fn cancel_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("✖️ Cancel", CallbackData::Cancel)]])
}

/// Draft/publish choice with the user's default marked.
pub fn draft_keyboard(session_id: u64, default_mode: PublishMode) -> InlineKeyboardMarkup {
    let draft = default_mode.is_draft();
    InlineKeyboardMarkup::new(vec![
        vec![
            button(
                checked("📝 Save as draft", draft),
                CallbackData::Draft(true, session_id),
            ),
            button(
                checked("🚀 Publish now", !draft),
                CallbackData::Draft(false, session_id),
            ),
        ],
        vec![button("✖️ Cancel", CallbackData::Cancel)],
    ])
}

pub fn confirm_keyboard(session_id: u64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        button("✅ Confirm", CallbackData::Confirm(session_id)),
        button("✖️ Cancel", CallbackData::Cancel),
    ]])
}

/// Keyboard that goes with the session's current prompt.
pub fn session_keyboard(
    view: &SessionView,
    default_mode: PublishMode,
) -> Option<InlineKeyboardMarkup> {
    match view.state {
        SessionState::Awaiting(Field::Draft) => Some(draft_keyboard(view.id, default_mode)),
        SessionState::Awaiting(_) => Some(cancel_keyboard()),
        SessionState::Ready if view.slug_suggestion.is_some() => {
            let label = if view.slug_sync {
                "🔗 Rename slug: on"
            } else {
                "🔗 Rename slug: off"
            };
            let mut keyboard = confirm_keyboard(view.id);
            keyboard
                .inline_keyboard
                .push(vec![button(label, CallbackData::SlugSync(view.id))]);
            Some(keyboard)
        }
        SessionState::Ready => Some(confirm_keyboard(view.id)),
        _ => None,
    }
}

/// Ask for the next field, or show the preview once ready.
pub fn session_prompt(view: &SessionView, default_mode: PublishMode) -> String {
    let field = match view.state {
        SessionState::Awaiting(field) => field,
        SessionState::Ready => return preview(view),
        _ => return "Nothing in progress.".to_string(),
    };
    let updating = view.action == Some(Action::Update);
    let keep_hint = if updating {
        "\n\nSend <code>-</code> to keep the current value."
    } else {
        ""
    };

    match field {
        Field::Slug => match view.action {
            Some(Action::Delete) => "🗑 Send the <b>slug</b> of the post to delete.".to_string(),
            _ => "✏️ Send the <b>slug</b> of the post to update.".to_string(),
        },
        Field::Title => format!(
            "{}📝 Send the {}<b>title</b>.{}",
            view.current.as_ref().map(current_post).unwrap_or_default(),
            if updating { "new " } else { "" },
            keep_hint
        ),
        Field::Body => format!(
            "📄 Now send the {}<b>body</b>.\n\n\
            Supported Markdown: <code>*emphasis*</code>, <code>***bold italics***</code>, \
            <code>`inline code`</code> and headings up to <code>###</code>.{}",
            if updating { "new " } else { "" },
            keep_hint
        ),
        Field::Draft => format!(
            "Save as <b>draft</b> or <b>publish</b> now? Answer <code>yes</code> for draft, \
            <code>no</code> to publish. Your default is <b>{}</b>.{}",
            default_mode, keep_hint
        ),
    }
}

/// The post being updated, as it is now.
fn current_post(post: &Post) -> String {
    let status = if post.is_draft() { "📝 Draft" } else { "🟢 Published" };
    let body = post.body_text().trim();
    let body = if body.is_empty() {
        "<i>(empty)</i>".to_string()
    } else {
        format!("<pre>{}</pre>", html_escape(&truncate(body, CURRENT_BODY_CHARS)))
    };
    format!(
        "<b>Current post</b> <code>{}</code> ({})\n<b>Title:</b> {}\n<b>Body:</b>\n{}\n\n",
        html_escape(&post.slug),
        status,
        escape_within(&post.title, TITLE_MAX_CHARS),
        body
    )
}

/// Preview of a ready session, capped at `PREVIEW_MAX_CHARS`.
pub fn preview(view: &SessionView) -> String {
    let shown = |field: Field, max_chars: usize| {
        view.get(field)
            .map(|v| escape_within(v, max_chars))
            .unwrap_or_else(|| "<i>(unchanged)</i>".to_string())
    };
    let status = |field: Field| match view.get(field) {
        Some("draft") => "📝 Draft".to_string(),
        Some(_) => "🟢 Publish".to_string(),
        None => "<i>(unchanged)</i>".to_string(),
    };

    let (head, body) = match view.action {
        Some(Action::Create) => (
            format!(
                "<b>Preview</b>\n\n<b>Title:</b> {}\n<b>Status:</b> {}\n\n",
                shown(Field::Title, TITLE_MAX_CHARS),
                status(Field::Draft)
            ),
            view.get(Field::Body),
        ),
        Some(Action::Update) => (
            format!(
                "<b>Update preview</b>\n\n<b>Slug:</b> {}\n<b>Title:</b> {}\n<b>Status:</b> {}\n\n",
                slug_line(view),
                shown(Field::Title, TITLE_MAX_CHARS),
                status(Field::Draft)
            ),
            view.get(Field::Body),
        ),
        Some(Action::Delete) => {
            return format!(
                "🗑 Delete <code>{}</code>? After confirming you have {} s to undo.\n\n\
                /confirm or /cancel",
                shown(Field::Slug, TITLE_MAX_CHARS),
                DELETE_GRACE.as_secs()
            )
        }
        Some(Action::List) => return "Ready to list your posts.".to_string(),
        None => return "Nothing in progress.".to_string(),
    };

    let mut notes = String::new();
    if let Some(body) = body {
        let filtered = filter_body(body);
        if !filtered.is_fully_supported() {
            let names: Vec<String> = filtered
                .unsupported
                .iter()
                .map(|s| html_escape(&s.to_string()))
                .collect();
            notes = format!(
                "\n\n⚠️ Sent as literal text (outside the supported subset): {}",
                names.join(", ")
            );
        }
    }
    let footer = format!("{}\n\n/confirm or /cancel", notes);

    let body_html = match (view.action, body) {
        (Some(Action::Update), None) => "<b>Body:</b> <i>(unchanged)</i>".to_string(),
        (_, body) => {
            let budget = PREVIEW_MAX_CHARS
                .saturating_sub(head.chars().count() + footer.chars().count() + 30);
            format!(
                "<b>Body:</b>\n<pre>{}</pre>",
                escape_within(body.unwrap_or(""), budget)
            )
        }
    };

    format!("{}{}{}", head, body_html, footer)
}

fn slug_line(view: &SessionView) -> String {
    let slug = view
        .get(Field::Slug)
        .map(|s| escape_within(s, TITLE_MAX_CHARS))
        .unwrap_or_default();
    match (&view.slug_suggestion, view.slug_sync) {
        (Some(new), true) => format!("<code>{}</code> → <code>{}</code>", slug, html_escape(new)),
        (Some(new), false) => format!(
            "<code>{}</code> (tap 🔗 to rename it to <code>{}</code>)",
            slug,
            html_escape(new)
        ),
        (None, _) => format!("<code>{}</code>", slug),
    }
}

/// Reply for a finished create, update or delete.
pub fn outcome_message(outcome: &ApiOutcome) -> String {
    let link = |url: &Option<String>| {
        url.as_deref()
            .map(|u| format!("\n{}", html_escape(u)))
            .unwrap_or_default()
    };

    match outcome {
        ApiOutcome::Created { receipt, is_draft } => format!(
            "{} {}{}",
            if *is_draft { "📝" } else { "🚀" },
            if *is_draft {
                "Draft saved."
            } else {
                "Post published."
            },
            match &receipt.slug {
                Some(slug) => {
                    format!(" Slug: <code>{}</code>{}", html_escape(slug), link(&receipt.url))
                }
                None => link(&receipt.url),
            }
        ),
        ApiOutcome::Updated { slug, receipt } => match receipt.slug.as_deref() {
            Some(new) if new != slug => format!(
                "✅ Updated <code>{}</code> (was <code>{}</code>).{}",
                html_escape(new),
                html_escape(slug),
                link(&receipt.url)
            ),
            _ => format!("✅ Updated <code>{}</code>.{}", html_escape(slug), link(&receipt.url)),
        },
        ApiOutcome::Deleted { slug } => format!("🗑 Deleted <code>{}</code>.", html_escape(slug)),
        ApiOutcome::Listed(posts) => format!("Found {} posts.", posts.len()),
    }
}

/// Reply after a list-row publish toggle.
pub fn publication_message(slug: &str, is_draft: bool) -> String {
    if is_draft {
        format!("📝 <code>{}</code> is now a draft.", html_escape(slug))
    } else {
        format!("🚀 <code>{}</code> is now published.", html_escape(slug))
    }
}

/// Shown while a delete waits out its undo window.
pub fn delete_pending_message(slug: &str) -> String {
    format!(
        "🗑 Deleting <code>{}</code> in {} s.",
        html_escape(slug),
        DELETE_GRACE.as_secs()
    )
}

pub fn undo_keyboard(token: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button(
        "↩️ Undo",
        CallbackData::Undo(token.to_string()),
    )]])
}

pub fn undone_message(slug: &str) -> String {
    format!("↩️ Kept <code>{}</code>. Nothing was deleted.", html_escape(slug))
}

/// Render one page of posts with its keyboard.
///
/// Every post gets edit, delete and publish buttons; `tokens` maps slugs to
/// the tokens those buttons carry. Search results get no page navigation
/// since the query is not carried in callback data.
pub fn list_message(
    posts: &[Post],
    query: &ListQuery,
    preview_length: usize,
    tokens: &HashMap<String, String>,
) -> (String, Option<InlineKeyboardMarkup>) {
    let page = paginate(posts, query);
    let text = list_text(&page, query, preview_length);

    let mut rows = row_buttons(&page, tokens);
    if query.search.is_none() {
        rows.extend(list_navigation(&page, query.filter));
    }
    let keyboard = (!rows.is_empty()).then(|| InlineKeyboardMarkup::new(rows));
    (text, keyboard)
}

fn list_text(page: &PostPage<'_>, query: &ListQuery, preview_length: usize) -> String {
    let mut header = format!("<b>📚 {} posts</b>", page.total);
    match &query.search {
        Some(search) => header.push_str(&format!(" matching “{}”", html_escape(search))),
        None if query.filter != ListFilter::All => {
            header.push_str(&format!(" ({})", query.filter));
        }
        None => {}
    }
    header.push_str(&format!(" · page {}/{}", page.page, page.total_pages));

    let mut lines = vec![header];
    if page.posts.is_empty() {
        lines.push("\nNo posts match.".to_string());
    }
    for (n, post) in page.posts.iter().enumerate() {
        let status = if post.is_draft() { "📝" } else { "🟢" };
        let title = if post.title.trim().is_empty() {
            "(untitled)"
        } else {
            post.title.as_str()
        };
        let mut entry = format!(
            "\n{}. {} <b>{}</b>\n<code>{}</code>",
            n + 1,
            status,
            html_escape(title),
            html_escape(&post.slug)
        );
        let body = post.body_text().trim();
        if !body.is_empty() {
            entry.push('\n');
            entry.push_str(&html_escape(&truncate(body, preview_length)));
        }
        lines.push(entry);
    }

    let text = lines.join("\n");
    if text.chars().count() > PREVIEW_MAX_CHARS {
        // Previews are the only long parts; fall back to titles only.
        let mut short = vec![lines[0].clone()];
        short.extend(page.posts.iter().enumerate().map(|(n, p)| {
            format!(
                "{}. {} <b>{}</b> <code>{}</code>",
                n + 1,
                if p.is_draft() { "📝" } else { "🟢" },
                html_escape(&truncate(&p.title, 80)),
                html_escape(&p.slug)
            )
        }));
        return short.join("\n");
    }
    text
}

/// One row of post actions per entry, numbered like the text.
fn row_buttons(
    page: &PostPage<'_>,
    tokens: &HashMap<String, String>,
) -> Vec<Vec<InlineKeyboardButton>> {
    page.posts
        .iter()
        .enumerate()
        .filter_map(|(n, post)| {
            let token = tokens.get(&post.slug)?;
            let row = |action| CallbackData::Row(action, token.clone());
            let toggle = if post.is_draft() { "🚀" } else { "📝" };
            Some(vec![
                button(format!("✏️ {}", n + 1), row(RowAction::Edit)),
                button(format!("🗑 {}", n + 1), row(RowAction::Delete)),
                button(format!("{} {}", toggle, n + 1), row(RowAction::TogglePublish)),
            ])
        })
        .collect()
}

fn list_navigation(page: &PostPage<'_>, filter: ListFilter) -> Vec<Vec<InlineKeyboardButton>> {
    let filters: Vec<InlineKeyboardButton> =
        [ListFilter::All, ListFilter::Published, ListFilter::Drafts]
            .into_iter()
            .map(|f| {
                let label = match f {
                    ListFilter::All => "All",
                    ListFilter::Published => "Published",
                    ListFilter::Drafts => "Drafts",
                };
                button(checked(label, f == filter), CallbackData::ListPage(f, 1))
            })
            .collect();

    let mut nav = Vec::new();
    if page.has_prev() {
        nav.push(button("◀️ Prev", CallbackData::ListPage(filter, page.page - 1)));
    }
    nav.push(button(
        format!("{}/{}", page.page, page.total_pages),
        CallbackData::Noop,
    ));
    if page.has_next() {
        nav.push(button("Next ▶️", CallbackData::ListPage(filter, page.page + 1)));
    }

    vec![filters, nav]
}

pub fn settings_message(settings: &UserSettings) -> String {
    format!(
        "<b>⚙️ Settings</b>\n\n\
        Default for new posts: <b>{}</b>\n\
        List preview length: <b>{}</b> characters\n\
        Ask before deleting: <b>{}</b>\n\n\
        Tap a button, or send <code>/settings preview 140|280|500</code>, \
        <code>/settings mode draft|publish</code> or <code>/settings confirm on|off</code>.",
        settings.default_publish_mode,
        settings.preview_length,
        if settings.confirm_before_delete { "on" } else { "off" }
    )
}

pub fn settings_keyboard(settings: &UserSettings) -> InlineKeyboardMarkup {
    let lengths: Vec<InlineKeyboardButton> = ALLOWED_PREVIEW_LENGTHS
        .iter()
        .map(|&n| {
            button(
                checked(&n.to_string(), n == settings.preview_length),
                CallbackData::Settings(SettingsChange::PreviewLength(n)),
            )
        })
        .collect();

    InlineKeyboardMarkup::new(vec![
        vec![button(
            format!("🔁 Default: {}", settings.default_publish_mode),
            CallbackData::Settings(SettingsChange::TogglePublishMode),
        )],
        lengths,
        vec![button(
            format!(
                "🗑 Ask before deleting: {}",
                if settings.confirm_before_delete { "on" } else { "off" }
            ),
            CallbackData::Settings(SettingsChange::ToggleConfirmDelete),
        )],
    ])
}

/// A failed API call that is not kept for retry.
pub fn api_error_message(error: &ApiError) -> String {
    format!("❌ Mataroa error: {}", html_escape(&error.to_string()))
}

/// Reply text for a session error.
pub fn error_message(error: &SessionError) -> String {
    match error {
        SessionError::Remote(e) => format!(
            "{}\n\nNothing was retried. Send /retry to try once more.",
            api_error_message(e)
        ),
        SessionError::Validation { .. } => format!("⚠️ {}", html_escape(&error.to_string())),
        other => html_escape(&other.to_string()),
    }
}

/// Reply when a post to update or toggle cannot be fetched.
pub fn lookup_failed_message(error: &ApiError) -> String {
    format!(
        "❌ Could not load that post: {}\n\nCheck the slug with /list.",
        html_escape(&error.to_string())
    )
}
