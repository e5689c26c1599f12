//! Composer session flows driven through the shared registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mataroa_core::{
    ApiError, ApiOutcome, ApiResult, BotConfig, NewPost, Post, PostChanges, PostReceipt,
    PostRequest, PostsApi,
};
use mataroa_persistence::{PublishMode, UserRecord};
use mataroa_telegram::{
    Action, BotState, CancelOutcome, Field, SessionError, SessionRegistry, SessionState,
};
use tempfile::TempDir;
use tokio::sync::Notify;

const KEY: &str = "secret-key";

/// Records every write and list call and optionally fails all of them.
///
/// Posts added with `with_post` are served by `get_post`, which is not
/// recorded.
#[derive(Default)]
struct RecordingApi {
    calls: Mutex<Vec<(String, PostRequest)>>,
    failing: AtomicBool,
    posts: Mutex<HashMap<String, Post>>,
}

impl RecordingApi {
    fn failing() -> Self {
        let api = Self::default();
        api.failing.store(true, Ordering::SeqCst);
        api
    }

    fn with_post(self, slug: &str, title: &str, published: bool) -> Self {
        self.posts.lock().unwrap().insert(
            slug.to_string(),
            Post {
                slug: slug.to_string(),
                title: title.to_string(),
                body: Some(format!("Body of {}", slug)),
                published_at: published.then(|| "2024-05-01".to_string()),
                url: None,
            },
        );
        self
    }

    fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<(String, PostRequest)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, api_key: &str, request: PostRequest) -> ApiResult<()> {
        self.calls.lock().unwrap().push((api_key.to_string(), request));
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                message: "maintenance".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PostsApi for RecordingApi {
    async fn create_post(&self, api_key: &str, post: &NewPost) -> ApiResult<PostReceipt> {
        self.record(api_key, PostRequest::Create(post.clone()))?;
        Ok(PostReceipt {
            slug: Some("hello".to_string()),
            url: Some("https://me.mataroa.blog/blog/hello/".to_string()),
        })
    }

    async fn update_post(
        &self,
        api_key: &str,
        slug: &str,
        changes: &PostChanges,
    ) -> ApiResult<PostReceipt> {
        self.record(
            api_key,
            PostRequest::Update {
                slug: slug.to_string(),
                changes: changes.clone(),
            },
        )?;
        Ok(PostReceipt {
            slug: Some(changes.slug.as_deref().unwrap_or(slug).to_string()),
            url: None,
        })
    }

    async fn get_post(&self, _api_key: &str, slug: &str) -> ApiResult<Post> {
        self.posts
            .lock()
            .unwrap()
            .get(slug)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(slug.to_string()))
    }

    async fn delete_post(&self, api_key: &str, slug: &str) -> ApiResult<()> {
        self.record(
            api_key,
            PostRequest::Delete {
                slug: slug.to_string(),
            },
        )
    }

    async fn list_posts(&self, api_key: &str) -> ApiResult<Vec<Post>> {
        self.record(api_key, PostRequest::List)?;
        Ok(Vec::new())
    }
}

/// Blocks inside `create_post` until released.
#[derive(Default)]
struct GatedApi {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl PostsApi for GatedApi {
    async fn create_post(&self, _api_key: &str, _post: &NewPost) -> ApiResult<PostReceipt> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(PostReceipt::default())
    }

    async fn update_post(&self, _: &str, _: &str, _: &PostChanges) -> ApiResult<PostReceipt> {
        Ok(PostReceipt::default())
    }

    async fn get_post(&self, _: &str, slug: &str) -> ApiResult<Post> {
        Err(ApiError::NotFound(slug.to_string()))
    }

    async fn delete_post(&self, _: &str, _: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn list_posts(&self, _: &str) -> ApiResult<Vec<Post>> {
        Ok(Vec::new())
    }
}

async fn compose_post(
    registry: &SessionRegistry,
    chat_id: i64,
    title: &str,
    body: &str,
    draft: &str,
) {
    registry.start(chat_id, Action::Create, KEY).await.unwrap();
    registry.supply(chat_id, title).await.unwrap();
    registry.supply(chat_id, body).await.unwrap();
    let view = registry.supply(chat_id, draft).await.unwrap();
    assert_eq!(view.state, SessionState::Ready);
}

#[tokio::test]
async fn test_create_flow_issues_exactly_one_call() {
    let api = RecordingApi::default();
    let registry = SessionRegistry::new();

    compose_post(&registry, 1, "Hello", "World", "no").await;
    assert!(api.calls().is_empty());

    let outcome = registry.confirm(1, &api).await.unwrap();
    assert!(matches!(outcome, ApiOutcome::Created { is_draft: false, .. }));

    let calls = api.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, KEY);
    assert_eq!(
        calls[0].1,
        PostRequest::Create(NewPost {
            title: "Hello".to_string(),
            body: "World".to_string(),
            is_draft: false,
        })
    );

    assert!(!registry.is_open(1).await);
    assert!(matches!(
        registry.confirm(1, &api).await,
        Err(SessionError::NoSession)
    ));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn test_second_action_conflicts() {
    let registry = SessionRegistry::new();
    registry.start(7, Action::Create, KEY).await.unwrap();

    let err = registry.start(7, Action::Delete, KEY).await.unwrap_err();
    assert_eq!(err, SessionError::Conflict(Action::Create));

    let view = registry.view(7).await.unwrap();
    assert_eq!(view.action, Some(Action::Create));
    assert_eq!(view.state, SessionState::Awaiting(Field::Title));
}

#[tokio::test]
async fn test_invalid_draft_answer_keeps_state() {
    let registry = SessionRegistry::new();
    registry.start(3, Action::Create, KEY).await.unwrap();
    registry.supply(3, "Title").await.unwrap();
    registry.supply(3, "Body").await.unwrap();

    let err = registry.supply(3, "maybe").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Validation {
            field: Field::Draft,
            ..
        }
    ));

    let view = registry.view(3).await.unwrap();
    assert_eq!(view.state, SessionState::Awaiting(Field::Draft));
    assert_eq!(view.get(Field::Title), Some("Title"));
    assert_eq!(view.get(Field::Body), Some("Body"));
}

#[tokio::test]
async fn test_body_markdown_is_sent_unchanged() {
    let api = RecordingApi::default();
    let registry = SessionRegistry::new();
    let body = "Some **bold** and _italic_ text\n\n| a | b |\n|---|---|";

    compose_post(&registry, 5, "Formatting", body, "yes").await;
    registry.confirm(5, &api).await.unwrap();

    match &api.calls()[0].1 {
        PostRequest::Create(post) => {
            assert_eq!(post.body, body);
            assert!(post.is_draft);
        }
        other => panic!("unexpected request: {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_then_supply_has_no_session() {
    let api = RecordingApi::default();
    let registry = SessionRegistry::new();
    registry.start(9, Action::Create, KEY).await.unwrap();
    registry.supply(9, "Draft title").await.unwrap();

    assert_eq!(registry.cancel(9).await, CancelOutcome::Cancelled(Action::Create));
    assert!(!registry.is_open(9).await);
    assert!(matches!(
        registry.supply(9, "more").await,
        Err(SessionError::NoSession)
    ));

    // Cancelling again is harmless.
    assert_eq!(registry.cancel(9).await, CancelOutcome::NothingOpen);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn test_update_keeps_unchanged_fields() {
    let api = RecordingApi::default();
    let registry = SessionRegistry::new();

    registry.start(2, Action::Update, KEY).await.unwrap();
    registry.supply(2, "my-post").await.unwrap();
    registry.supply(2, "New title").await.unwrap();
    registry.supply(2, "-").await.unwrap();
    registry.supply(2, "-").await.unwrap();
    registry.confirm(2, &api).await.unwrap();

    assert_eq!(
        api.calls()[0].1,
        PostRequest::Update {
            slug: "my-post".to_string(),
            changes: PostChanges {
                title: Some("New title".to_string()),
                ..Default::default()
            },
        }
    );
}

#[tokio::test]
async fn test_failure_in_one_chat_leaves_other_chat_untouched() {
    let api = RecordingApi::failing();
    let registry = SessionRegistry::new();

    compose_post(&registry, 100, "A", "first", "no").await;
    registry.start(200, Action::Create, KEY).await.unwrap();
    registry.supply(200, "B").await.unwrap();

    let err = registry.confirm(100, &api).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Remote(ApiError::Status { status: 503, .. })
    ));
    assert!(registry.has_failed(100).await);
    assert!(!registry.is_open(100).await);

    let other = registry.view(200).await.unwrap();
    assert_eq!(other.state, SessionState::Awaiting(Field::Body));
    assert_eq!(other.get(Field::Title), Some("B"));
    assert!(!registry.has_failed(200).await);
}

#[tokio::test]
async fn test_retry_reissues_failed_request_once() {
    let api = RecordingApi::failing();
    let registry = SessionRegistry::new();

    compose_post(&registry, 11, "Retry me", "body", "no").await;
    assert!(registry.confirm(11, &api).await.is_err());
    assert_eq!(api.calls().len(), 1);

    // Still failing: the request stays available.
    assert!(registry.retry(11, &api).await.is_err());
    assert!(registry.has_failed(11).await);

    api.recover();
    let outcome = registry.retry(11, &api).await.unwrap();
    assert!(matches!(outcome, ApiOutcome::Created { .. }));
    assert!(!registry.has_failed(11).await);

    let calls = api.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|(_, req)| req == &calls[0].1));

    assert!(matches!(
        registry.retry(11, &api).await,
        Err(SessionError::NothingToRetry)
    ));
}

#[tokio::test]
async fn test_retry_refused_while_composing() {
    let api = RecordingApi::failing();
    let registry = SessionRegistry::new();

    compose_post(&registry, 12, "T", "B", "no").await;
    assert!(registry.confirm(12, &api).await.is_err());

    registry.start(12, Action::Delete, KEY).await.unwrap();
    assert!(matches!(
        registry.retry(12, &api).await,
        Err(SessionError::Conflict(Action::Delete))
    ));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn test_cancel_clears_failed_request() {
    let api = RecordingApi::failing();
    let registry = SessionRegistry::new();

    compose_post(&registry, 13, "T", "B", "no").await;
    assert!(registry.confirm(13, &api).await.is_err());
    assert!(registry.has_failed(13).await);

    registry.cancel(13).await;
    assert!(!registry.has_failed(13).await);
}

#[tokio::test]
async fn test_session_is_busy_while_call_in_flight() {
    let api = Arc::new(GatedApi::default());
    let registry = Arc::new(SessionRegistry::new());

    compose_post(&registry, 21, "Slow", "post", "no").await;

    let task = {
        let api = Arc::clone(&api);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.confirm(21, api.as_ref()).await })
    };

    api.entered.notified().await;
    assert!(registry.is_open(21).await);
    assert!(matches!(
        registry.supply(21, "late").await,
        Err(SessionError::Busy)
    ));
    assert!(matches!(
        registry.confirm(21, api.as_ref()).await,
        Err(SessionError::Busy)
    ));

    // Other chats are not blocked by the call.
    registry.start(22, Action::Create, KEY).await.unwrap();

    api.release.notify_one();
    assert!(task.await.unwrap().is_ok());
    assert!(!registry.is_open(21).await);
}

#[tokio::test]
async fn test_list_session_is_ready_immediately() {
    let api = RecordingApi::default();
    let registry = SessionRegistry::new();

    let view = registry.start(30, Action::List, KEY).await.unwrap();
    assert_eq!(view.state, SessionState::Ready);

    let outcome = registry.confirm(30, &api).await.unwrap();
    assert_eq!(outcome, ApiOutcome::Listed(Vec::new()));
    assert_eq!(api.calls()[0].1, PostRequest::List);
}

fn config_in(dir: &TempDir, persist: bool) -> BotConfig {
    let bot_dir = dir.path().to_string_lossy().to_string();
    let vars: HashMap<&str, String> = HashMap::from([
        ("BOT_TOKEN", "123:abc".to_string()),
        ("MATAROA_BOT_DIR", bot_dir),
        ("ALLOWLIST_IDS", "42".to_string()),
        (
            "MATAROA_PERSIST_USERS",
            if persist { "1" } else { "0" }.to_string(),
        ),
    ]);
    BotConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

#[tokio::test]
async fn test_api_keys_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, true);
    let api: Arc<dyn PostsApi> = Arc::new(RecordingApi::default());

    let state = BotState::from_config(&config, Arc::clone(&api));
    assert!(state.persists_users());
    assert!(state.is_allowed(42));
    assert!(!state.is_allowed(43));
    state.set_api_key(42, "key-42").await;
    state.set_preview_length(42, 500).await;

    let restarted = BotState::from_config(&config, api);
    assert_eq!(restarted.api_key(42).await.as_deref(), Some("key-42"));
    assert_eq!(restarted.preview_length(42).await, 500);
}

#[tokio::test]
async fn test_no_persist_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, false);
    let api: Arc<dyn PostsApi> = Arc::new(RecordingApi::default());

    let state = BotState::from_config(&config, api);
    assert!(!state.persists_users());
    state.set_api_key(42, "key-42").await;

    assert_eq!(state.api_key(42).await.as_deref(), Some("key-42"));
    assert!(!config.users_file.exists());
}

#[tokio::test]
async fn test_cancel_during_call_reports_in_flight() {
    let api = Arc::new(GatedApi::default());
    let registry = Arc::new(SessionRegistry::new());

    compose_post(&registry, 23, "Slow", "post", "no").await;

    let task = {
        let api = Arc::clone(&api);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.confirm(23, api.as_ref()).await })
    };

    api.entered.notified().await;
    assert_eq!(registry.cancel(23).await, CancelOutcome::InFlight);

    api.release.notify_one();
    assert!(task.await.unwrap().is_ok());
    assert!(!registry.has_failed(23).await);

    // The chat is free for a new action.
    let view = registry.start(23, Action::Create, KEY).await.unwrap();
    assert_eq!(view.state, SessionState::Awaiting(Field::Title));
}

#[tokio::test]
async fn test_old_draft_button_does_not_feed_new_session() {
    let api = RecordingApi::default();
    let registry = SessionRegistry::new();

    let first = registry.start(40, Action::Create, KEY).await.unwrap();
    registry.supply(40, "First").await.unwrap();
    registry.supply(40, "Body").await.unwrap();
    registry.cancel(40).await;

    let second = registry.start(40, Action::Create, KEY).await.unwrap();
    assert_ne!(first.id, second.id);

    assert_eq!(
        registry.supply_field(40, first.id, Field::Draft, "yes").await,
        Err(SessionError::Stale)
    );
    // The new session is not at the draft step yet either.
    assert_eq!(
        registry.supply_field(40, second.id, Field::Draft, "yes").await,
        Err(SessionError::Stale)
    );
    assert!(matches!(
        registry.confirm_session(40, first.id, &api).await,
        Err(SessionError::Stale)
    ));

    let view = registry.view(40).await.unwrap();
    assert_eq!(view.state, SessionState::Awaiting(Field::Title));
    assert_eq!(view.get(Field::Title), None);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn test_confirm_button_sends_once() {
    let api = RecordingApi::default();
    let registry = SessionRegistry::new();

    compose_post(&registry, 41, "Once", "only", "no").await;
    let id = registry.view(41).await.unwrap().id;

    assert!(registry.confirm_session(41, id, &api).await.is_ok());
    assert!(matches!(
        registry.confirm_session(41, id, &api).await,
        Err(SessionError::Stale)
    ));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn test_update_starts_from_current_post() {
    let api = RecordingApi::default().with_post("my-post", "Old title", true);
    let registry = SessionRegistry::new();

    registry.start(50, Action::Update, KEY).await.unwrap();
    let view = registry.supply(50, "my-post").await.unwrap();
    assert!(view.needs_lookup());

    let view = registry.lookup_current(50, &api).await.unwrap();
    assert!(!view.needs_lookup());
    let current = view.current.unwrap();
    assert_eq!(current.title, "Old title");
    assert!(!current.is_draft());

    // Looking up again does not refetch or change anything.
    let again = registry.lookup_current(50, &api).await.unwrap();
    assert_eq!(again.state, SessionState::Awaiting(Field::Title));

    registry.supply(50, "-").await.unwrap();
    registry.supply(50, "New body").await.unwrap();
    registry.supply(50, "-").await.unwrap();
    registry.confirm(50, &api).await.unwrap();
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn test_update_of_unknown_post_ends_session() {
    let api = RecordingApi::default();
    let registry = SessionRegistry::new();

    registry.start(51, Action::Update, KEY).await.unwrap();
    registry.supply(51, "missing").await.unwrap();

    let err = registry.lookup_current(51, &api).await.unwrap_err();
    assert_eq!(err, SessionError::Remote(ApiError::NotFound("missing".into())));
    assert!(!registry.is_open(51).await);
    assert!(!registry.has_failed(51).await);
    assert!(api.calls().is_empty());

    registry.start(51, Action::Update, KEY).await.unwrap();
}

#[tokio::test]
async fn test_slug_sync_renames_post() {
    let api = RecordingApi::default().with_post("old-post", "Old", true);
    let registry = SessionRegistry::new();

    registry.start(52, Action::Update, KEY).await.unwrap();
    registry.supply(52, "old-post").await.unwrap();
    registry.lookup_current(52, &api).await.unwrap();
    registry.supply(52, "Brand New Title").await.unwrap();
    registry.supply(52, "-").await.unwrap();
    let view = registry.supply(52, "-").await.unwrap();
    assert_eq!(view.slug_suggestion.as_deref(), Some("brand-new-title"));

    let view = registry.toggle_slug_sync(52, view.id).await.unwrap();
    assert!(view.slug_sync);

    let outcome = registry.confirm(52, &api).await.unwrap();
    match outcome {
        ApiOutcome::Updated { slug, receipt } => {
            assert_eq!(slug, "old-post");
            assert_eq!(receipt.slug.as_deref(), Some("brand-new-title"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        api.calls()[0].1,
        PostRequest::Update {
            slug: "old-post".into(),
            changes: PostChanges {
                title: Some("Brand New Title".into()),
                slug: Some("brand-new-title".into()),
                ..Default::default()
            },
        }
    );
}

fn state_with(api: Arc<RecordingApi>) -> Arc<BotState> {
    let users = BTreeMap::from([(42, UserRecord::new(KEY))]);
    Arc::new(BotState::new(api, users, HashSet::new(), None))
}

const GRACE: Duration = Duration::from_millis(20);

#[tokio::test]
async fn test_detached_delete_runs_after_grace() {
    let api = Arc::new(RecordingApi::default());
    let state = state_with(Arc::clone(&api));

    state.sessions().start(42, Action::Delete, KEY).await.unwrap();
    state.sessions().supply(42, "old-post").await.unwrap();
    let pending = state.sessions().detach(42, None).await.unwrap();
    assert!(!state.sessions().is_open(42).await);
    assert!(api.calls().is_empty());

    let job = {
        let state = Arc::clone(&state);
        async move {
            state.run_detached(42, 42, pending).await.unwrap();
        }
    };
    assert!(state.pending_deletes().schedule(42, "old-post", GRACE, job).await);

    tokio::time::sleep(GRACE * 10).await;
    assert_eq!(
        api.calls(),
        vec![(KEY.to_string(), PostRequest::Delete { slug: "old-post".into() })]
    );
    assert!(!state.pending_deletes().undo(42, "old-post").await);
}

#[tokio::test]
async fn test_undo_keeps_post() {
    let api = Arc::new(RecordingApi::default());
    let state = state_with(Arc::clone(&api));

    state.sessions().start(42, Action::Delete, KEY).await.unwrap();
    state.sessions().supply(42, "keep-me").await.unwrap();
    let pending = state.sessions().detach(42, None).await.unwrap();

    let job = {
        let state = Arc::clone(&state);
        async move {
            let _ = state.run_detached(42, 42, pending).await;
        }
    };
    state.pending_deletes().schedule(42, "keep-me", GRACE, job).await;
    assert!(state.pending_deletes().undo(42, "keep-me").await);

    tokio::time::sleep(GRACE * 10).await;
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn test_detach_needs_ready_session() {
    let state = state_with(Arc::new(RecordingApi::default()));

    assert!(matches!(
        state.sessions().detach(42, None).await,
        Err(SessionError::NoSession)
    ));
    let view = state.sessions().start(42, Action::Delete, KEY).await.unwrap();
    assert!(matches!(
        state.sessions().detach(42, Some(view.id)).await,
        Err(SessionError::NotReady(Field::Slug))
    ));
    state.sessions().supply(42, "post").await.unwrap();
    assert!(matches!(
        state.sessions().detach(42, Some(view.id + 1)).await,
        Err(SessionError::Stale)
    ));
    assert!(state.sessions().detach(42, Some(view.id)).await.is_ok());
}

#[tokio::test]
async fn test_failed_detached_request_can_be_retried() {
    let api = Arc::new(RecordingApi::failing());
    let state = state_with(Arc::clone(&api));

    let publish = PostRequest::Update {
        slug: "draft-post".into(),
        changes: PostChanges::publication(false),
    };
    let pending = mataroa_telegram::PendingRequest {
        api_key: KEY.to_string(),
        request: publish.clone(),
    };
    assert!(state.run_detached(42, 42, pending).await.is_err());
    assert!(state.sessions().has_failed(42).await);
    assert_eq!(state.user(42).await.unwrap().last_action, Some(publish.clone()));

    api.recover();
    assert!(state.retry(42, 42).await.is_ok());
    assert_eq!(state.user(42).await.unwrap().last_action, None);
    assert_eq!(api.calls().len(), 2);
    assert_eq!(api.calls()[1].1, publish);
}

#[tokio::test]
async fn test_slug_tokens_are_per_user() {
    let state = state_with(Arc::new(RecordingApi::default()));

    let tokens = state.slug_tokens(42, ["a-post", "b-post"]).await;
    let token = &tokens["b-post"];
    assert_eq!(state.slug_for_token(42, token).await.as_deref(), Some("b-post"));
    assert_eq!(state.slug_token(42, "b-post").await, *token);
    assert_eq!(state.slug_for_token(7, token).await, None);
}

#[tokio::test]
async fn test_failed_request_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, true);

    let down = Arc::new(RecordingApi::failing());
    let state = BotState::from_config(&config, down);
    state.set_api_key(42, "key-42").await;
    state.sessions().start(42, Action::Create, "key-42").await.unwrap();
    state.sessions().supply(42, "Unsent").await.unwrap();
    state.sessions().supply(42, "Body").await.unwrap();
    state.sessions().supply(42, "yes").await.unwrap();
    assert!(state.confirm(42, 42, None).await.is_err());

    let saved = PostRequest::Create(NewPost {
        title: "Unsent".into(),
        body: "Body".into(),
        is_draft: true,
    });
    assert_eq!(state.user(42).await.unwrap().last_action, Some(saved.clone()));

    let up = Arc::new(RecordingApi::default());
    let restarted = BotState::from_config(&config, Arc::clone(&up) as Arc<dyn PostsApi>);
    assert!(!restarted.sessions().has_failed(42).await);
    let outcome = restarted.retry(42, 42).await.unwrap();
    assert!(matches!(outcome, ApiOutcome::Created { is_draft: true, .. }));
    assert_eq!(up.calls(), vec![("key-42".to_string(), saved)]);

    let again = BotState::from_config(&config, up);
    assert_eq!(again.user(42).await.unwrap().last_action, None);
    assert!(matches!(
        again.retry(42, 42).await,
        Err(SessionError::NothingToRetry)
    ));
}

#[tokio::test]
async fn test_cancel_forgets_saved_request() {
    let api = Arc::new(RecordingApi::failing());
    let state = state_with(Arc::clone(&api));

    compose_post(state.sessions(), 42, "T", "B", "no").await;
    assert!(state.confirm(42, 42, None).await.is_err());
    assert!(state.user(42).await.unwrap().last_action.is_some());

    assert_eq!(state.cancel(42, 42).await, CancelOutcome::NothingOpen);
    assert_eq!(state.user(42).await.unwrap().last_action, None);
}

#[tokio::test]
async fn test_failed_list_is_not_saved() {
    let state = state_with(Arc::new(RecordingApi::failing()));

    state.sessions().start(42, Action::List, KEY).await.unwrap();
    assert!(state.confirm(42, 42, None).await.is_err());
    assert!(state.sessions().has_failed(42).await);
    assert_eq!(state.user(42).await.unwrap().last_action, None);
}

#[tokio::test]
async fn test_settings_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, true);
    let api: Arc<dyn PostsApi> = Arc::new(RecordingApi::default());

    let state = BotState::from_config(&config, Arc::clone(&api));
    state.set_api_key(42, "key-42").await;
    let settings = state
        .update_settings(42, |s| {
            s.default_publish_mode = PublishMode::Publish;
            s.confirm_before_delete = false;
        })
        .await;
    assert_eq!(settings.default_publish_mode, PublishMode::Publish);

    let restarted = BotState::from_config(&config, api);
    let settings = restarted.settings(42).await;
    assert_eq!(settings.default_publish_mode, PublishMode::Publish);
    assert!(!settings.confirm_before_delete);
    assert_eq!(settings.preview_length, mataroa_core::DEFAULT_PREVIEW_LENGTH);
}
