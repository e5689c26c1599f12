//! Shared state for the Telegram bot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mataroa_core::{ApiOutcome, BotConfig, ListQuery, PostRequest, PostsApi};
use mataroa_persistence::{UserRecord, UserSettings, UserStore};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::session::{
    Action, ComposerSession, Field, PendingRequest, SessionError, SessionState, SessionView,
};
use crate::tokens::SlugTokens;
use crate::undo::PendingDeletes;

/// What `/cancel` found in the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// An open session was discarded.
    Cancelled(Action),
    /// The session was dropped while its call was in flight. The call still finishes.
    InFlight,
    /// No session was open.
    NothingOpen,
}

/// Composer sessions keyed by chat id.
///
/// The map lock is only held to look up, insert or remove an entry. Remote
/// calls hold just the chat's own session lock, so one slow chat never
/// blocks another.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, Arc<Mutex<ComposerSession>>>>,
    failed: Mutex<HashMap<i64, PendingRequest>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, chat_id: i64) -> Option<Arc<Mutex<ComposerSession>>> {
        self.sessions.read().await.get(&chat_id).cloned()
    }

    /// Start `action` for `chat_id`. At most one open session per chat.
    pub async fn start(
        &self,
        chat_id: i64,
        action: Action,
        api_key: &str,
    ) -> Result<SessionView, SessionError> {
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(&chat_id) {
            let guard = existing.try_lock().map_err(|_| SessionError::Busy)?;
            if guard.state().is_open() {
                return Err(SessionError::Conflict(guard.action().unwrap_or(action)));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut session = ComposerSession::new(chat_id).with_id(id);
        session.start(action, api_key)?;
        let view = session.view();
        sessions.insert(chat_id, Arc::new(Mutex::new(session)));

        info!(chat_id, session_id = id, action = ?action, "Session opened");
        Ok(view)
    }

    /// Feed one value to the chat's open session.
    pub async fn supply(&self, chat_id: i64, value: &str) -> Result<SessionView, SessionError> {
        let session = self.get(chat_id).await.ok_or(SessionError::NoSession)?;
        let mut guard = session.try_lock().map_err(|_| SessionError::Busy)?;
        guard.supply(value)?;
        Ok(guard.view())
    }

    /// Answer `field` from a button of session `session_id`.
    ///
    /// `Stale` unless that session is still the chat's and awaits `field`.
    pub async fn supply_field(
        &self,
        chat_id: i64,
        session_id: u64,
        field: Field,
        value: &str,
    ) -> Result<SessionView, SessionError> {
        let session = self.get(chat_id).await.ok_or(SessionError::Stale)?;
        let mut guard = session.try_lock().map_err(|_| SessionError::Busy)?;
        if guard.id() != session_id {
            return Err(SessionError::Stale);
        }
        guard.supply_field(field, value)?;
        Ok(guard.view())
    }

    /// Fetch the post an update starts from.
    ///
    /// A no-op unless the session has a slug and nothing fetched yet. If the
    /// post cannot be fetched the session ends; nothing is kept for retry.
    pub async fn lookup_current(
        &self,
        chat_id: i64,
        api: &dyn PostsApi,
    ) -> Result<SessionView, SessionError> {
        let session = self.get(chat_id).await.ok_or(SessionError::NoSession)?;
        let mut guard = session.try_lock().map_err(|_| SessionError::Busy)?;
        let Some((slug, api_key)) = guard.lookup_target() else {
            return Ok(guard.view());
        };

        match api.get_post(&api_key, &slug).await {
            Ok(post) => {
                debug!(chat_id, slug = %slug, "Fetched post to update");
                guard.set_current(post);
                Ok(guard.view())
            }
            Err(e) => {
                guard.fail();
                drop(guard);
                self.remove_if_current(chat_id, &session).await;
                info!(chat_id, slug = %slug, error = %e, "Post lookup failed; update ended");
                Err(SessionError::Remote(e))
            }
        }
    }

    /// Flip slug sync on the chat's ready update.
    pub async fn toggle_slug_sync(
        &self,
        chat_id: i64,
        session_id: u64,
    ) -> Result<SessionView, SessionError> {
        let session = self.get(chat_id).await.ok_or(SessionError::Stale)?;
        let mut guard = session.try_lock().map_err(|_| SessionError::Busy)?;
        if guard.id() != session_id {
            return Err(SessionError::Stale);
        }
        guard.toggle_slug_sync()?;
        Ok(guard.view())
    }

    /// Current snapshot of the chat's session, if any.
    pub async fn view(&self, chat_id: i64) -> Option<SessionView> {
        let session = self.get(chat_id).await?;
        let guard = session.try_lock().ok()?;
        Some(guard.view())
    }

    /// Whether the chat has a session awaiting input or confirmation.
    ///
    /// A session that is mid-call counts as open.
    pub async fn is_open(&self, chat_id: i64) -> bool {
        match self.get(chat_id).await {
            Some(session) => match session.try_lock() {
                Ok(guard) => guard.state().is_open(),
                Err(_) => true,
            },
            None => false,
        }
    }

    /// Send the chat's ready session. The session is removed afterwards
    /// whether the call succeeded or failed; a failed request is kept for
    /// `retry`.
    pub async fn confirm(
        &self,
        chat_id: i64,
        api: &dyn PostsApi,
    ) -> Result<ApiOutcome, SessionError> {
        self.confirm_matching(chat_id, None, api).await
    }

    /// `confirm`, but only for session `session_id` and only once it is ready.
    pub async fn confirm_session(
        &self,
        chat_id: i64,
        session_id: u64,
        api: &dyn PostsApi,
    ) -> Result<ApiOutcome, SessionError> {
        self.confirm_matching(chat_id, Some(session_id), api).await
    }

    async fn confirm_matching(
        &self,
        chat_id: i64,
        session_id: Option<u64>,
        api: &dyn PostsApi,
    ) -> Result<ApiOutcome, SessionError> {
        let missing = if session_id.is_some() {
            SessionError::Stale
        } else {
            SessionError::NoSession
        };
        let session = self.get(chat_id).await.ok_or(missing)?;
        let mut guard = session.try_lock().map_err(|_| SessionError::Busy)?;

        if let Some(id) = session_id {
            if guard.id() != id || guard.state() != SessionState::Ready {
                return Err(SessionError::Stale);
            }
        }

        let pending = guard.pending_request();
        let result = guard.confirm(api).await;
        let finished = guard.state().is_terminal();
        drop(guard);

        if !finished {
            return result;
        }

        let still_registered = self.remove_if_current(chat_id, &session).await;

        match &result {
            Err(SessionError::Remote(e)) if still_registered => {
                if let Some(pending) = pending {
                    self.failed.lock().await.insert(chat_id, pending);
                }
                warn!(chat_id, error = %e, "Request failed; /retry available");
            }
            Ok(_) => {
                self.failed.lock().await.remove(&chat_id);
            }
            _ => {}
        }

        result
    }

    /// Take the ready request out of the chat's session without sending it.
    ///
    /// The session is closed. With `session_id`, only that session qualifies.
    pub async fn detach(
        &self,
        chat_id: i64,
        session_id: Option<u64>,
    ) -> Result<PendingRequest, SessionError> {
        let session = self.get(chat_id).await.ok_or(SessionError::NoSession)?;
        let mut guard = session.try_lock().map_err(|_| SessionError::Busy)?;
        if session_id.is_some_and(|id| id != guard.id()) {
            return Err(SessionError::Stale);
        }
        let pending = guard.detach()?;
        drop(guard);
        self.remove_if_current(chat_id, &session).await;
        Ok(pending)
    }

    /// Discard the chat's session and any failed request. Always succeeds.
    ///
    /// A session that is mid-call is dropped from the map; its call still
    /// finishes but nothing is kept for retry.
    pub async fn cancel(&self, chat_id: i64) -> CancelOutcome {
        let removed = self.sessions.write().await.remove(&chat_id);
        let had_failed = self.failed.lock().await.remove(&chat_id).is_some();

        let outcome = match removed {
            Some(session) => match session.try_lock() {
                Ok(mut guard) => guard
                    .cancel()
                    .map(CancelOutcome::Cancelled)
                    .unwrap_or(CancelOutcome::NothingOpen),
                Err(_) => {
                    debug!(chat_id, "Cancelled a session with a call in flight");
                    CancelOutcome::InFlight
                }
            },
            None => CancelOutcome::NothingOpen,
        };

        debug!(chat_id, outcome = ?outcome, had_failed, "Cancel");
        outcome
    }

    /// Whether a failed request can be retried in this chat.
    pub async fn has_failed(&self, chat_id: i64) -> bool {
        self.failed.lock().await.contains_key(&chat_id)
    }

    /// The chat's failed request, if any.
    pub async fn failed_request(&self, chat_id: i64) -> Option<PendingRequest> {
        self.failed.lock().await.get(&chat_id).cloned()
    }

    /// Make `pending` the chat's retryable request.
    pub async fn restore_failed(&self, chat_id: i64, pending: PendingRequest) {
        self.failed.lock().await.insert(chat_id, pending);
    }

    /// Re-issue the chat's last failed request once.
    ///
    /// Refused while another action is open. If it fails again it stays
    /// available for another explicit retry.
    pub async fn retry(
        &self,
        chat_id: i64,
        api: &dyn PostsApi,
    ) -> Result<ApiOutcome, SessionError> {
        if let Some(session) = self.get(chat_id).await {
            if let Ok(guard) = session.try_lock() {
                if guard.state().is_open() {
                    return Err(SessionError::Conflict(guard.action().unwrap_or(Action::List)));
                }
            } else {
                return Err(SessionError::Busy);
            }
        }

        let pending = self
            .failed
            .lock()
            .await
            .remove(&chat_id)
            .ok_or(SessionError::NothingToRetry)?;

        info!(chat_id, request = pending.request.kind(), "Retrying failed request");
        match api.execute(&pending.api_key, &pending.request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.failed.lock().await.insert(chat_id, pending);
                Err(SessionError::Remote(e))
            }
        }
    }

    async fn remove_if_current(
        &self,
        chat_id: i64,
        session: &Arc<Mutex<ComposerSession>>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&chat_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&chat_id);
                true
            }
            _ => false,
        }
    }
}

/// Shared state for the Telegram bot, accessible across all handlers.
pub struct BotState {
    /// Blog API used by every chat.
    api: Arc<dyn PostsApi>,
    /// Composer sessions.
    sessions: SessionRegistry,
    /// Known users (telegram user id -> record).
    users: RwLock<BTreeMap<u64, UserRecord>>,
    /// Users admitted to the bot; empty admits everyone.
    allowlist: HashSet<u64>,
    /// Users whose next plain message is their API key.
    awaiting_key: RwLock<HashSet<u64>>,
    /// Slug tokens used in list-row buttons, per user.
    tokens: RwLock<HashMap<u64, SlugTokens>>,
    /// Last list shown in each chat, refreshed after a row action.
    last_lists: RwLock<HashMap<i64, ListQuery>>,
    /// Deletes waiting out their undo window.
    deletes: PendingDeletes,
    /// Where user records are saved; `None` keeps them in memory only.
    store: Option<UserStore>,
}

impl BotState {
    pub fn new(
        api: Arc<dyn PostsApi>,
        users: BTreeMap<u64, UserRecord>,
        allowlist: HashSet<u64>,
        store: Option<UserStore>,
    ) -> Self {
        if allowlist.is_empty() {
            warn!("Allowlist is empty - every Telegram user may use this bot");
        }

        Self {
            api,
            sessions: SessionRegistry::new(),
            users: RwLock::new(users),
            allowlist,
            awaiting_key: RwLock::new(HashSet::new()),
            tokens: RwLock::new(HashMap::new()),
            last_lists: RwLock::new(HashMap::new()),
            deletes: PendingDeletes::new(),
            store,
        }
    }

    /// Build the state from configuration, loading `users.json` if enabled.
    ///
    /// An unreadable users file is logged and treated as empty.
    pub fn from_config(config: &BotConfig, api: Arc<dyn PostsApi>) -> Self {
        let mut allowlist = config.allowlist.clone();
        let mut users = BTreeMap::new();

        let store = config
            .persist_users
            .then(|| UserStore::new(config.users_file.clone()));

        if let Some(store) = &store {
            match store.load() {
                Ok(file) => {
                    info!(
                        users = file.users.len(),
                        allowlisted = file.allowlist.len(),
                        path = %store.path().display(),
                        "Loaded users file"
                    );
                    allowlist.extend(file.allowlist);
                    users = file.users;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %store.path().display(),
                        "Could not load users file; starting empty"
                    );
                }
            }
        } else {
            info!("User persistence disabled; API keys stay in memory");
        }

        Self::new(api, users, allowlist, store)
    }

    pub fn api(&self) -> &dyn PostsApi {
        self.api.as_ref()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn pending_deletes(&self) -> &PendingDeletes {
        &self.deletes
    }

    pub fn persists_users(&self) -> bool {
        self.store.is_some()
    }

    /// Whether `user_id` may use the bot.
    pub fn is_allowed(&self, user_id: u64) -> bool {
        self.allowlist.is_empty() || self.allowlist.contains(&user_id)
    }

    pub async fn user(&self, user_id: u64) -> Option<UserRecord> {
        self.users.read().await.get(&user_id).cloned()
    }

    /// The user's API key, if one was set.
    pub async fn api_key(&self, user_id: u64) -> Option<String> {
        self.user(user_id)
            .await
            .filter(UserRecord::has_api_key)
            .map(|u| u.api_key)
    }

    pub async fn settings(&self, user_id: u64) -> UserSettings {
        self.user(user_id)
            .await
            .map(|u| u.settings)
            .unwrap_or_default()
    }

    pub async fn preview_length(&self, user_id: u64) -> usize {
        self.settings(user_id).await.preview_length
    }

    /// Store (or replace) a user's API key.
    pub async fn set_api_key(&self, user_id: u64, api_key: &str) {
        {
            let mut users = self.users.write().await;
            users
                .entry(user_id)
                .and_modify(|u| u.api_key = api_key.to_string())
                .or_insert_with(|| UserRecord::new(api_key));
        }
        self.awaiting_key.write().await.remove(&user_id);
        info!(user_id, "API key saved");
        self.persist().await;
    }

    /// Change a user's settings and save them. Returns the new settings.
    pub async fn update_settings<F>(&self, user_id: u64, change: F) -> UserSettings
    where
        F: FnOnce(&mut UserSettings),
    {
        let settings = {
            let mut users = self.users.write().await;
            let record = users.entry(user_id).or_insert_with(|| UserRecord::new(""));
            change(&mut record.settings);
            record.settings
        };
        debug!(user_id, settings = ?settings, "Settings changed");
        self.persist().await;
        settings
    }

    pub async fn set_preview_length(&self, user_id: u64, length: usize) {
        self.update_settings(user_id, |s| s.preview_length = length).await;
    }

    pub async fn expect_api_key(&self, user_id: u64) {
        self.awaiting_key.write().await.insert(user_id);
    }

    pub async fn is_awaiting_key(&self, user_id: u64) -> bool {
        self.awaiting_key.read().await.contains(&user_id)
    }

    pub async fn stop_awaiting_key(&self, user_id: u64) -> bool {
        self.awaiting_key.write().await.remove(&user_id)
    }

    /// Send the chat's ready session and remember a failure across restarts.
    pub async fn confirm(
        &self,
        chat_id: i64,
        user_id: u64,
        session_id: Option<u64>,
    ) -> Result<ApiOutcome, SessionError> {
        let result = match session_id {
            Some(id) => self.sessions.confirm_session(chat_id, id, self.api()).await,
            None => self.sessions.confirm(chat_id, self.api()).await,
        };
        self.sync_last_action(chat_id, user_id).await;
        result
    }

    /// Retry the chat's failed request.
    ///
    /// After a restart the request saved with the user record is used, sent
    /// with the user's current key.
    pub async fn retry(&self, chat_id: i64, user_id: u64) -> Result<ApiOutcome, SessionError> {
        if !self.sessions.has_failed(chat_id).await {
            let saved = self.user(user_id).await.and_then(|u| u.last_action);
            if let (Some(request), Some(api_key)) = (saved, self.api_key(user_id).await) {
                info!(chat_id, request = request.kind(), "Restored saved request for retry");
                self.sessions
                    .restore_failed(chat_id, PendingRequest { api_key, request })
                    .await;
            }
        }
        let result = self.sessions.retry(chat_id, self.api()).await;
        self.sync_last_action(chat_id, user_id).await;
        result
    }

    /// Cancel the chat's session and forget its failed request.
    pub async fn cancel(&self, chat_id: i64, user_id: u64) -> CancelOutcome {
        let outcome = self.sessions.cancel(chat_id).await;
        self.sync_last_action(chat_id, user_id).await;
        outcome
    }

    /// Send a request that was taken out of its session.
    ///
    /// A failure becomes the chat's retryable request.
    pub async fn run_detached(
        &self,
        chat_id: i64,
        user_id: u64,
        pending: PendingRequest,
    ) -> Result<ApiOutcome, SessionError> {
        match self.api.execute(&pending.api_key, &pending.request).await {
            Ok(outcome) => {
                info!(chat_id, request = pending.request.kind(), "Request completed");
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    chat_id,
                    request = pending.request.kind(),
                    error = %e,
                    "Request failed; /retry available"
                );
                self.sessions.restore_failed(chat_id, pending).await;
                self.sync_last_action(chat_id, user_id).await;
                Err(SessionError::Remote(e))
            }
        }
    }

    /// Token for `slug` in this user's list buttons.
    pub async fn slug_token(&self, user_id: u64, slug: &str) -> String {
        self.tokens
            .write()
            .await
            .entry(user_id)
            .or_default()
            .token_for(slug)
    }

    /// Tokens for every slug in `slugs`, keyed by slug.
    pub async fn slug_tokens<'a, I>(&self, user_id: u64, slugs: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut tokens = self.tokens.write().await;
        let user_tokens = tokens.entry(user_id).or_default();
        slugs
            .into_iter()
            .map(|slug| (slug.to_string(), user_tokens.token_for(slug)))
            .collect()
    }

    pub async fn slug_for_token(&self, user_id: u64, token: &str) -> Option<String> {
        self.tokens
            .read()
            .await
            .get(&user_id)
            .and_then(|t| t.slug(token))
            .map(str::to_string)
    }

    pub async fn remember_list(&self, chat_id: i64, query: ListQuery) {
        self.last_lists.write().await.insert(chat_id, query);
    }

    /// The list last shown in `chat_id`, or all posts.
    pub async fn last_list(&self, chat_id: i64) -> ListQuery {
        self.last_lists
            .read()
            .await
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Save the chat's failed request with the user, or clear it.
    ///
    /// Lists are cheap to redo and are never saved.
    async fn sync_last_action(&self, chat_id: i64, user_id: u64) {
        let failed = self
            .sessions
            .failed_request(chat_id)
            .await
            .map(|p| p.request)
            .filter(|r| !matches!(r, PostRequest::List));

        let changed = {
            let mut users = self.users.write().await;
            match users.get_mut(&user_id) {
                Some(record) if record.last_action != failed => {
                    record.last_action = failed;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.persist().await;
        }
    }

    /// Write user records to disk if persistence is enabled.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let users = self.users.read().await.clone();
        if let Err(e) = store.save_users(&users) {
            error!(error = %e, path = %store.path().display(), "Failed to save users file");
        } else {
            debug!(count = users.len(), "Saved users file");
        }
    }
}

/// Create shared state wrapped in Arc.
pub fn create_shared_state(config: &BotConfig, api: Arc<dyn PostsApi>) -> Arc<BotState> {
    Arc::new(BotState::from_config(config, api))
}
