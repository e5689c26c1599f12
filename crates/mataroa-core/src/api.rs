//! Mataroa posts API client.
//!
//! The `PostsApi` trait is the boundary between the chat front-end and the
//! blog service; `MataroaClient` implements it over HTTP. Every call is a
//! single attempt: failures are returned to the caller, never retried here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{ApiError, ApiResult};
use crate::post::{NewPost, Post, PostChanges, PostReceipt};
use crate::slug::{is_valid_slug, truncate};

/// Longest raw response body quoted in an error message.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// The single remote call a composed action resolves to.
///
/// Serializable so a failed request can be saved and retried later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostRequest {
    Create(NewPost),
    Update { slug: String, changes: PostChanges },
    Delete { slug: String },
    List,
}

impl PostRequest {
    /// Short verb for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::List => "list",
        }
    }
}

/// Result of a successful `PostRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOutcome {
    Created { receipt: PostReceipt, is_draft: bool },
    Updated { slug: String, receipt: PostReceipt },
    Deleted { slug: String },
    Listed(Vec<Post>),
}

/// Operations of the blog posts API.
#[async_trait]
pub trait PostsApi: Send + Sync {
    /// Create a post.
    async fn create_post(&self, api_key: &str, post: &NewPost) -> ApiResult<PostReceipt>;

    /// Apply `changes` to the post identified by `slug`.
    async fn update_post(
        &self,
        api_key: &str,
        slug: &str,
        changes: &PostChanges,
    ) -> ApiResult<PostReceipt>;

    /// Fetch one post with its body.
    async fn get_post(&self, api_key: &str, slug: &str) -> ApiResult<Post>;

    /// Delete a post.
    async fn delete_post(&self, api_key: &str, slug: &str) -> ApiResult<()>;

    /// List all posts of the account.
    async fn list_posts(&self, api_key: &str) -> ApiResult<Vec<Post>>;

    /// Issue exactly one call for `request`.
    async fn execute(&self, api_key: &str, request: &PostRequest) -> ApiResult<ApiOutcome> {
        match request {
            PostRequest::Create(post) => {
                let receipt = self.create_post(api_key, post).await?;
                Ok(ApiOutcome::Created {
                    receipt,
                    is_draft: post.is_draft,
                })
            }
            PostRequest::Update { slug, changes } => {
                let receipt = self.update_post(api_key, slug, changes).await?;
                Ok(ApiOutcome::Updated {
                    slug: slug.clone(),
                    receipt,
                })
            }
            PostRequest::Delete { slug } => {
                self.delete_post(api_key, slug).await?;
                Ok(ApiOutcome::Deleted { slug: slug.clone() })
            }
            PostRequest::List => Ok(ApiOutcome::Listed(self.list_posts(api_key).await?)),
        }
    }
}

/// HTTP client for `https://mataroa.blog/api/posts/`.
#[derive(Debug, Clone)]
pub struct MataroaClient {
    http: reqwest::Client,
    base_url: Url,
}

impl MataroaClient {
    /// Create a client for the posts endpoint at `base_url`.
    ///
    /// `base_url` must end with `/` so slugs are appended as path segments.
    pub fn new(base_url: Url, timeout: Duration) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mataroa-bot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self { http, base_url })
    }

    /// The posts endpoint this client talks to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn post_url(&self, slug: &str) -> ApiResult<Url> {
        if !is_valid_slug(slug) {
            return Err(ApiError::InvalidSlug(slug.to_string()));
        }
        self.base_url
            .join(&format!("{}/", slug))
            .map_err(|e| ApiError::InvalidSlug(format!("{}: {}", slug, e)))
    }

    fn request(&self, method: Method, url: Url, api_key: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
    }

    /// Send a request and return its JSON body (`Null` when empty).
    async fn send(&self, builder: RequestBuilder, slug: Option<&str>) -> ApiResult<Value> {
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body: Option<Value> = serde_json::from_str(&text).ok();

        debug!(status = status.as_u16(), bytes = text.len(), "Mataroa API response");

        if !status.is_success() {
            let message = body
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| fallback_message(&text, status.canonical_reason()));
            return Err(match status.as_u16() {
                401 | 403 => ApiError::Unauthorized {
                    status: status.as_u16(),
                    message,
                },
                404 => ApiError::NotFound(slug.map(str::to_string).unwrap_or(message)),
                code => ApiError::Status {
                    status: code,
                    message,
                },
            });
        }

        match body {
            Some(value) => {
                if value.get("ok").and_then(Value::as_bool) == Some(false) {
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        message: error_message(&value)
                            .unwrap_or_else(|| "request was not accepted".to_string()),
                    });
                }
                Ok(value)
            }
            None if text.trim().is_empty() => Ok(Value::Null),
            None => Err(ApiError::InvalidResponse(format!(
                "expected JSON, got: {}",
                truncate(text.trim(), MAX_ERROR_BODY_CHARS)
            ))),
        }
    }
}

#[async_trait]
impl PostsApi for MataroaClient {
    async fn create_post(&self, api_key: &str, post: &NewPost) -> ApiResult<PostReceipt> {
        let payload = post.payload(today());
        debug!(title = %post.title, draft = post.is_draft, "Creating post");
        let builder = self
            .request(Method::POST, self.base_url.clone(), api_key)
            .json(&payload);
        receipt_from(self.send(builder, None).await?)
    }

    async fn update_post(
        &self,
        api_key: &str,
        slug: &str,
        changes: &PostChanges,
    ) -> ApiResult<PostReceipt> {
        let url = self.post_url(slug)?;
        let payload = changes.payload(today());
        debug!(slug = %slug, "Updating post");
        let builder = self.request(Method::PATCH, url, api_key).json(&payload);
        let mut receipt = receipt_from(self.send(builder, Some(slug)).await?)?;
        if receipt.slug.is_none() {
            receipt.slug = Some(changes.slug.as_deref().unwrap_or(slug).to_string());
        }
        Ok(receipt)
    }

    async fn get_post(&self, api_key: &str, slug: &str) -> ApiResult<Post> {
        let url = self.post_url(slug)?;
        let value = self.send(self.request(Method::GET, url, api_key), Some(slug)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_post(&self, api_key: &str, slug: &str) -> ApiResult<()> {
        let url = self.post_url(slug)?;
        debug!(slug = %slug, "Deleting post");
        self.send(self.request(Method::DELETE, url, api_key), Some(slug))
            .await?;
        Ok(())
    }

    async fn list_posts(&self, api_key: &str) -> ApiResult<Vec<Post>> {
        let builder = self.request(Method::GET, self.base_url.clone(), api_key);
        let value = self.send(builder, None).await?;

        let list = match value {
            Value::Array(_) => value,
            Value::Object(mut map) => map
                .remove("post_list")
                .filter(Value::is_array)
                .ok_or_else(|| ApiError::InvalidResponse("missing post_list".to_string()))?,
            other => {
                return Err(ApiError::InvalidResponse(format!(
                    "unexpected list body: {}",
                    other
                )))
            }
        };

        Ok(serde_json::from_value(list)?)
    }
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

fn receipt_from(value: Value) -> ApiResult<PostReceipt> {
    if value.is_null() {
        return Ok(PostReceipt::default());
    }
    Ok(serde_json::from_value(value)?)
}

/// Pull a human-readable message out of an error body.
fn error_message(value: &Value) -> Option<String> {
    ["error", "detail", "message"]
        .iter()
        .find_map(|key| value.get(key))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

fn fallback_message(text: &str, reason: Option<&str>) -> String {
    let text = text.trim();
    if text.is_empty() {
        reason.unwrap_or("no details").to_string()
    } else {
        truncate(text, MAX_ERROR_BODY_CHARS)
    }
}
