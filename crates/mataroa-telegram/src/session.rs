//! Post composer session.
//!
//! A `ComposerSession` turns a short sequence of chat messages into exactly
//! one blog API call. It is a plain state machine:
//!
//! ```text
//! idle -> awaiting(field) -> ... -> ready -> completed | failed
//!            \________________________/
//!                      cancel -> aborted
//! ```

use std::collections::HashMap;
use std::fmt;

use mataroa_core::{
    filter_body, is_valid_slug, slugify, ApiError, ApiOutcome, NewPost, Post, PostChanges,
    PostRequest, PostsApi,
};
use thiserror::Error;
use tracing::{debug, info};

/// Values that leave a field unchanged during an update.
const KEEP_TOKENS: [&str; 3] = ["-", "skip", "keep"];

/// What the session will do once confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Delete,
    List,
}

impl Action {
    /// Fields collected for this action, in prompt order.
    pub fn fields(self) -> &'static [Field] {
        match self {
            Self::Create => &[Field::Title, Field::Body, Field::Draft],
            Self::Update => &[Field::Slug, Field::Title, Field::Body, Field::Draft],
            Self::Delete => &[Field::Slug],
            Self::List => &[],
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "new post",
            Self::Update => "post update",
            Self::Delete => "post deletion",
            Self::List => "post listing",
        })
    }
}

/// A value the session asks the user for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Slug,
    Title,
    Body,
    Draft,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Slug => "slug",
            Self::Title => "title",
            Self::Body => "body",
            Self::Draft => "draft flag",
        })
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Awaiting(Field),
    Ready,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    /// Awaiting input or confirmation.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Awaiting(_) | Self::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Errors from session operations. Each one is answered in the chat.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The supplied value does not fit the awaited field.
    #[error("Invalid {field}: {reason}")]
    Validation { field: Field, reason: String },

    /// Another action is still open in this chat.
    #[error("A {0} is already in progress. Finish it or /cancel it first.")]
    Conflict(Action),

    /// Nothing has been started (or it was cancelled).
    #[error("Nothing in progress. Start with /new, /update, /delete or /list.")]
    NoSession,

    /// `confirm` before every field was supplied.
    #[error("Not ready yet: please send the {0} first.")]
    NotReady(Field),

    /// Input arrived while the session waits for confirmation.
    #[error("Everything is filled in. Use /confirm to send it or /cancel to drop it.")]
    NotAwaiting,

    /// The chat's session is in the middle of an API call.
    #[error("Still waiting for Mataroa to answer. Try again in a moment.")]
    Busy,

    /// No failed request to retry.
    #[error("There is no failed request to retry.")]
    NothingToRetry,

    /// A button from an earlier prompt or another session was pressed.
    #[error("This button is no longer active.")]
    Stale,

    /// The blog API call failed.
    #[error("{0}")]
    Remote(#[from] ApiError),
}

/// A request plus the key it is sent with; kept for `/retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub api_key: String,
    pub request: PostRequest,
}

/// Snapshot of a session for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    /// Identifies the session in button callback data.
    pub id: u64,
    pub action: Option<Action>,
    pub state: SessionState,
    /// Collected values in prompt order. Fields kept unchanged are absent.
    pub fields: Vec<(Field, String)>,
    /// The post being updated, as fetched from the service.
    pub current: Option<Post>,
    /// Slug derived from the new title when it differs from the current one.
    pub slug_suggestion: Option<String>,
    /// Whether the update renames the post to `slug_suggestion`.
    pub slug_sync: bool,
}

impl SessionView {
    pub fn get(&self, field: Field) -> Option<&str> {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.as_str())
    }

    /// An update whose slug is known but whose post has not been fetched yet.
    pub fn needs_lookup(&self) -> bool {
        self.action == Some(Action::Update)
            && self.state == SessionState::Awaiting(Field::Title)
            && self.current.is_none()
    }
}

/// Per-chat conversational state machine.
#[derive(Debug)]
pub struct ComposerSession {
    id: u64,
    chat_id: i64,
    pending_action: Option<Action>,
    collected: HashMap<Field, String>,
    api_key: Option<String>,
    state: SessionState,
    current: Option<Post>,
    slug_sync: bool,
}

impl ComposerSession {
    pub fn new(chat_id: i64) -> Self {
        Self {
            id: 0,
            chat_id,
            pending_action: None,
            collected: HashMap::new(),
            api_key: None,
            state: SessionState::Idle,
            current: None,
            slug_sync: false,
        }
    }

    /// Tag the session so buttons can name it.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn action(&self) -> Option<Action> {
        self.pending_action
    }

    /// Begin `action`. Rejected while another action is open.
    pub fn start(&mut self, action: Action, api_key: &str) -> Result<SessionState, SessionError> {
        if self.state.is_open() {
            return Err(SessionError::Conflict(
                self.pending_action.unwrap_or(action),
            ));
        }

        self.pending_action = Some(action);
        self.collected.clear();
        self.current = None;
        self.slug_sync = false;
        self.api_key = Some(api_key.to_string());
        self.state = match action.fields().first() {
            Some(field) => SessionState::Awaiting(*field),
            None => SessionState::Ready,
        };

        debug!(chat_id = self.chat_id, action = ?action, state = ?self.state, "Session started");
        Ok(self.state)
    }

    /// Validate `value` against the awaited field and advance.
    ///
    /// On rejection the state is left exactly as it was.
    pub fn supply(&mut self, value: &str) -> Result<SessionState, SessionError> {
        let field = match self.state {
            SessionState::Awaiting(field) => field,
            SessionState::Ready => return Err(SessionError::NotAwaiting),
            _ => return Err(SessionError::NoSession),
        };
        let action = self.pending_action.ok_or(SessionError::NoSession)?;

        match validate(action, field, value)? {
            Some(accepted) => {
                self.collected.insert(field, accepted);
            }
            None => {
                if field == Field::Draft && self.update_changes().is_empty() {
                    return Err(SessionError::Validation {
                        field,
                        reason: "nothing to change; give a new title, body or draft flag"
                            .to_string(),
                    });
                }
            }
        }

        if field == Field::Title {
            self.slug_sync = false;
        }
        self.state = next_state(action, field);
        debug!(chat_id = self.chat_id, field = %field, state = ?self.state, "Field accepted");
        Ok(self.state)
    }

    /// Like `supply`, but only while `field` is the one awaited.
    ///
    /// Used for button answers, which may come from an earlier prompt.
    pub fn supply_field(
        &mut self,
        field: Field,
        value: &str,
    ) -> Result<SessionState, SessionError> {
        if self.state != SessionState::Awaiting(field) {
            return Err(SessionError::Stale);
        }
        self.supply(value)
    }

    /// Slug and key needed to fetch the post an update starts from.
    pub fn lookup_target(&self) -> Option<(String, String)> {
        if !self.view().needs_lookup() {
            return None;
        }
        Some((
            self.collected.get(&Field::Slug)?.clone(),
            self.api_key.clone()?,
        ))
    }

    /// Remember the post being updated.
    pub fn set_current(&mut self, post: Post) {
        self.current = Some(post);
    }

    /// End the session after a failed lookup. Nothing is kept for retry.
    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.api_key = None;
    }

    /// Turn renaming to the title-derived slug on or off. Returns the new flag.
    pub fn toggle_slug_sync(&mut self) -> Result<bool, SessionError> {
        if self.state != SessionState::Ready || self.pending_action != Some(Action::Update) {
            return Err(SessionError::Stale);
        }
        if self.slug_suggestion().is_none() {
            return Err(SessionError::Validation {
                field: Field::Slug,
                reason: "the new title does not give a different slug".to_string(),
            });
        }
        self.slug_sync = !self.slug_sync;
        debug!(chat_id = self.chat_id, slug_sync = self.slug_sync, "Slug sync toggled");
        Ok(self.slug_sync)
    }

    /// Slug derived from the new title, when valid and different from the current slug.
    fn slug_suggestion(&self) -> Option<String> {
        if self.pending_action != Some(Action::Update) {
            return None;
        }
        let title = self.collected.get(&Field::Title)?;
        let current = self.collected.get(&Field::Slug)?;
        let suggested = slugify(title);
        (is_valid_slug(&suggested) && suggested != *current).then_some(suggested)
    }

    /// Build the one request this session resolves to. Only valid in `Ready`.
    pub fn request(&self) -> Result<PostRequest, SessionError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Awaiting(field) => return Err(SessionError::NotReady(field)),
            _ => return Err(SessionError::NoSession),
        }
        let action = self.pending_action.ok_or(SessionError::NoSession)?;
        let value = |field: Field| self.collected.get(&field).cloned();

        Ok(match action {
            Action::Create => PostRequest::Create(NewPost {
                title: value(Field::Title).unwrap_or_default(),
                body: value(Field::Body).unwrap_or_default(),
                is_draft: self.draft_flag().unwrap_or(true),
            }),
            Action::Update => PostRequest::Update {
                slug: value(Field::Slug).unwrap_or_default(),
                changes: PostChanges {
                    slug: self.slug_suggestion().filter(|_| self.slug_sync),
                    ..self.update_changes()
                },
            },
            Action::Delete => PostRequest::Delete {
                slug: value(Field::Slug).unwrap_or_default(),
            },
            Action::List => PostRequest::List,
        })
    }

    /// The request and key that `confirm` would send.
    pub fn pending_request(&self) -> Option<PendingRequest> {
        Some(PendingRequest {
            api_key: self.api_key.clone()?,
            request: self.request().ok()?,
        })
    }

    /// Issue the single remote call. `Completed` on success, `Failed` on error.
    pub async fn confirm(&mut self, api: &dyn PostsApi) -> Result<ApiOutcome, SessionError> {
        let request = self.request()?;
        let api_key = self.api_key.clone().ok_or(SessionError::NoSession)?;

        report_unsupported_markdown(self.chat_id, &request);

        match api.execute(&api_key, &request).await {
            Ok(outcome) => {
                self.state = SessionState::Completed;
                info!(chat_id = self.chat_id, request = request.kind(), "Request completed");
                Ok(outcome)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                info!(
                    chat_id = self.chat_id,
                    request = request.kind(),
                    error = %e,
                    "Request failed"
                );
                Err(SessionError::Remote(e))
            }
        }
    }

    /// Hand the ready request to the caller instead of sending it here.
    ///
    /// The session completes; the caller owns the call from now on.
    pub fn detach(&mut self) -> Result<PendingRequest, SessionError> {
        let request = self.request()?;
        let api_key = self.api_key.take().ok_or(SessionError::NoSession)?;
        self.state = SessionState::Completed;
        debug!(chat_id = self.chat_id, request = request.kind(), "Request detached");
        Ok(PendingRequest { api_key, request })
    }

    /// Drop everything collected. Always succeeds.
    pub fn cancel(&mut self) -> Option<Action> {
        let was_open = self.state.is_open();
        self.collected.clear();
        self.current = None;
        self.api_key = None;
        self.state = SessionState::Aborted;
        let action = self.pending_action.take();
        debug!(chat_id = self.chat_id, was_open, "Session cancelled");
        action.filter(|_| was_open)
    }

    pub fn view(&self) -> SessionView {
        let fields = self
            .pending_action
            .map(|action| {
                action
                    .fields()
                    .iter()
                    .filter_map(|f| self.collected.get(f).map(|v| (*f, v.clone())))
                    .collect()
            })
            .unwrap_or_default();

        SessionView {
            id: self.id,
            action: self.pending_action,
            state: self.state,
            fields,
            current: self.current.clone(),
            slug_suggestion: self.slug_suggestion(),
            slug_sync: self.slug_sync,
        }
    }

    fn draft_flag(&self) -> Option<bool> {
        self.collected.get(&Field::Draft).map(|v| v == DRAFT)
    }

    /// Title, body and draft changes collected so far.
    fn update_changes(&self) -> PostChanges {
        PostChanges {
            title: self.collected.get(&Field::Title).cloned(),
            body: self.collected.get(&Field::Body).cloned(),
            is_draft: self.draft_flag(),
            slug: None,
        }
    }
}

/// Normalized draft-flag values stored in the session.
const DRAFT: &str = "draft";
const PUBLISH: &str = "publish";

/// Parse a draft flag: `Some(true)` keeps the post as a draft.
pub fn parse_draft_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "yes" | "y" | "true" | "draft" => Some(true),
        "no" | "n" | "false" | "publish" => Some(false),
        _ => None,
    }
}

/// Whether `value` means "leave this field as it is".
pub fn is_keep_token(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    KEEP_TOKENS.contains(&value.as_str())
}

/// Check one value. `Ok(None)` means the field is deliberately left unchanged.
fn validate(action: Action, field: Field, value: &str) -> Result<Option<String>, SessionError> {
    let trimmed = value.trim();
    let invalid = |reason: &str| SessionError::Validation {
        field,
        reason: reason.to_string(),
    };

    if action == Action::Update && field != Field::Slug && is_keep_token(trimmed) {
        return Ok(None);
    }

    match field {
        Field::Title | Field::Body => {
            if trimmed.is_empty() {
                return Err(invalid("it must not be empty"));
            }
            Ok(Some(trimmed.to_string()))
        }
        Field::Draft => match parse_draft_flag(trimmed) {
            Some(true) => Ok(Some(DRAFT.to_string())),
            Some(false) => Ok(Some(PUBLISH.to_string())),
            None => Err(invalid("answer yes (save as draft) or no (publish now)")),
        },
        Field::Slug => {
            if !is_valid_slug(trimmed) {
                return Err(invalid(
                    "use 1-128 lowercase letters, digits or dashes (e.g. my-first-post)",
                ));
            }
            Ok(Some(trimmed.to_string()))
        }
    }
}

fn next_state(action: Action, current: Field) -> SessionState {
    let fields = action.fields();
    fields
        .iter()
        .position(|f| *f == current)
        .and_then(|i| fields.get(i + 1))
        .map(|f| SessionState::Awaiting(*f))
        .unwrap_or(SessionState::Ready)
}

fn report_unsupported_markdown(chat_id: i64, request: &PostRequest) {
    let body = match request {
        PostRequest::Create(post) => Some(post.body.as_str()),
        PostRequest::Update { changes, .. } => changes.body.as_deref(),
        _ => None,
    };
    if let Some(body) = body {
        let filtered = filter_body(body);
        if !filtered.is_fully_supported() {
            debug!(
                chat_id,
                unsupported = ?filtered.unsupported,
                "Body uses Markdown outside the subset"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(action: Action) -> ComposerSession {
        let mut session = ComposerSession::new(1);
        session.start(action, "key").unwrap();
        session
    }

    #[test]
    fn test_create_walks_fields_in_order() {
        let mut session = started(Action::Create);
        assert_eq!(session.state(), SessionState::Awaiting(Field::Title));
        assert_eq!(session.supply("  Hello ").unwrap(), SessionState::Awaiting(Field::Body));
        assert_eq!(session.supply("World").unwrap(), SessionState::Awaiting(Field::Draft));
        assert_eq!(session.supply("No").unwrap(), SessionState::Ready);

        assert_eq!(
            session.request().unwrap(),
            PostRequest::Create(NewPost {
                title: "Hello".into(),
                body: "World".into(),
                is_draft: false,
            })
        );
    }

    #[test]
    fn test_list_is_ready_immediately() {
        let session = started(Action::List);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.request().unwrap(), PostRequest::List);
    }

    #[test]
    fn test_second_start_conflicts() {
        let mut session = started(Action::Create);
        assert_eq!(
            session.start(Action::Delete, "key"),
            Err(SessionError::Conflict(Action::Create))
        );
        assert_eq!(session.state(), SessionState::Awaiting(Field::Title));
    }

    #[test]
    fn test_restart_after_terminal_state() {
        let mut session = started(Action::Delete);
        session.cancel();
        assert_eq!(session.start(Action::List, "key"), Ok(SessionState::Ready));
    }

    #[test]
    fn test_invalid_draft_flag_keeps_state() {
        let mut session = started(Action::Create);
        session.supply("T").unwrap();
        session.supply("B").unwrap();

        let err = session.supply("maybe").unwrap_err();
        assert!(matches!(err, SessionError::Validation { field: Field::Draft, .. }));
        assert_eq!(session.state(), SessionState::Awaiting(Field::Draft));
    }

    #[test]
    fn test_empty_title_rejected() {
        let mut session = started(Action::Create);
        assert!(session.supply("   ").is_err());
        assert_eq!(session.state(), SessionState::Awaiting(Field::Title));
    }

    #[test]
    fn test_bad_slug_rejected() {
        let mut session = started(Action::Delete);
        assert!(session.supply("Not A Slug").is_err());
        assert_eq!(session.supply("a-slug").unwrap(), SessionState::Ready);
    }

    #[test]
    fn test_update_with_keep_tokens() {
        let mut session = started(Action::Update);
        session.supply("my-post").unwrap();
        session.supply("-").unwrap();
        session.supply("New body").unwrap();
        session.supply("keep").unwrap();

        assert_eq!(
            session.request().unwrap(),
            PostRequest::Update {
                slug: "my-post".into(),
                changes: PostChanges {
                    body: Some("New body".into()),
                    ..Default::default()
                },
            }
        );
        assert_eq!(session.view().get(Field::Title), None);
    }

    #[test]
    fn test_update_with_nothing_to_change_is_rejected() {
        let mut session = started(Action::Update);
        session.supply("my-post").unwrap();
        session.supply("skip").unwrap();
        session.supply("skip").unwrap();

        assert!(session.supply("skip").is_err());
        assert_eq!(session.state(), SessionState::Awaiting(Field::Draft));

        // Changing only the draft flag is enough.
        assert_eq!(session.supply("publish").unwrap(), SessionState::Ready);
    }

    #[test]
    fn test_cancel_discards_fields() {
        let mut session = started(Action::Create);
        session.supply("Hello").unwrap();

        assert_eq!(session.cancel(), Some(Action::Create));
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(session.view().fields.is_empty());
        assert_eq!(session.supply("World"), Err(SessionError::NoSession));
        assert_eq!(session.request(), Err(SessionError::NoSession));
    }

    #[test]
    fn test_cancel_without_session_succeeds() {
        let mut session = ComposerSession::new(9);
        assert_eq!(session.cancel(), None);
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_supply_when_ready_is_rejected() {
        let mut session = started(Action::Delete);
        session.supply("x").unwrap();
        assert_eq!(session.supply("y"), Err(SessionError::NotAwaiting));
    }

    #[test]
    fn test_request_before_ready() {
        let session = started(Action::Create);
        assert_eq!(session.request(), Err(SessionError::NotReady(Field::Title)));
        assert!(session.pending_request().is_none());
    }

    #[test]
    fn test_draft_flag_aliases() {
        for yes in ["yes", "Y", "TRUE", "draft"] {
            assert_eq!(parse_draft_flag(yes), Some(true), "{}", yes);
        }
        for no in ["no", "n", "False", "publish"] {
            assert_eq!(parse_draft_flag(no), Some(false), "{}", no);
        }
        assert_eq!(parse_draft_flag("maybe"), None);
    }

    #[test]
    fn test_create_accepts_dash_title() {
        let mut session = started(Action::Create);
        session.supply("-").unwrap();
        assert_eq!(session.view().get(Field::Title), Some("-"));
    }

    #[test]
    fn test_button_answer_for_other_field_is_stale() {
        let mut session = started(Action::Create);
        assert_eq!(session.supply_field(Field::Draft, "yes"), Err(SessionError::Stale));
        assert!(session.view().fields.is_empty());

        session.supply("T").unwrap();
        session.supply("B").unwrap();
        assert_eq!(session.supply_field(Field::Draft, "yes"), Ok(SessionState::Ready));
    }

    #[test]
    fn test_update_lookup_target() {
        let mut session = started(Action::Update);
        assert_eq!(session.lookup_target(), None);

        session.supply("old-post").unwrap();
        assert!(session.view().needs_lookup());
        assert_eq!(
            session.lookup_target(),
            Some(("old-post".to_string(), "key".to_string()))
        );

        session.set_current(Post {
            slug: "old-post".into(),
            title: "Old".into(),
            body: Some("Body".into()),
            published_at: None,
            url: None,
        });
        assert_eq!(session.lookup_target(), None);
        assert_eq!(session.view().current.map(|p| p.title), Some("Old".to_string()));
    }

    #[test]
    fn test_slug_sync_renames_post() {
        let mut session = started(Action::Update);
        session.supply("old-post").unwrap();
        session.supply("Brand New Title").unwrap();
        session.supply("-").unwrap();
        session.supply("-").unwrap();

        let view = session.view();
        assert_eq!(view.slug_suggestion.as_deref(), Some("brand-new-title"));
        assert!(!view.slug_sync);
        assert!(matches!(
            session.request().unwrap(),
            PostRequest::Update { changes: PostChanges { slug: None, .. }, .. }
        ));

        assert_eq!(session.toggle_slug_sync(), Ok(true));
        assert_eq!(
            session.request().unwrap(),
            PostRequest::Update {
                slug: "old-post".into(),
                changes: PostChanges {
                    title: Some("Brand New Title".into()),
                    slug: Some("brand-new-title".into()),
                    ..Default::default()
                },
            }
        );
        assert_eq!(session.toggle_slug_sync(), Ok(false));
    }

    #[test]
    fn test_slug_sync_needs_a_different_slug() {
        let mut session = started(Action::Update);
        session.supply("hello-world").unwrap();
        session.supply("Hello World").unwrap();
        session.supply("-").unwrap();
        session.supply("-").unwrap();

        assert_eq!(session.view().slug_suggestion, None);
        assert!(matches!(
            session.toggle_slug_sync(),
            Err(SessionError::Validation { field: Field::Slug, .. })
        ));
    }

    #[test]
    fn test_detach_completes_session() {
        let mut session = started(Action::Delete);
        assert!(session.detach().is_err());

        session.supply("gone").unwrap();
        let pending = session.detach().unwrap();
        assert_eq!(pending.api_key, "key");
        assert_eq!(pending.request, PostRequest::Delete { slug: "gone".into() });
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.start(Action::List, "key"), Ok(SessionState::Ready));
    }

    #[test]
    fn test_slug_sync_only_when_ready() {
        let mut session = started(Action::Create);
        assert_eq!(session.toggle_slug_sync(), Err(SessionError::Stale));
    }
}
