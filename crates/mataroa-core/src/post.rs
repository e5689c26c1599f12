//! Post types for the Mataroa posts API.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Date format the API uses for `published_at`.
const DATE_FORMAT: &str = "%Y-%m-%d";

/// A post as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Identifier assigned by the service.
    pub slug: String,

    /// Post title.
    #[serde(default)]
    pub title: String,

    /// Markdown body. The list endpoint may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    /// Publication date; `None` means the post is a draft.
    #[serde(default)]
    pub published_at: Option<String>,

    /// Public URL of the post.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Post {
    /// Whether the post is still unpublished.
    pub fn is_draft(&self) -> bool {
        self.published_at
            .as_deref()
            .map(|d| d.trim().is_empty())
            .unwrap_or(true)
    }

    /// The body, or an empty string when the API did not send one.
    pub fn body_text(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }
}

/// A post to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
    pub title: String,
    pub body: String,
    pub is_draft: bool,
}

impl NewPost {
    /// Build the JSON payload, publishing on `today` unless this is a draft.
    pub fn payload(&self, today: NaiveDate) -> CreatePayload<'_> {
        CreatePayload {
            title: &self.title,
            body: &self.body,
            published_at: publication_date(self.is_draft, today),
        }
    }
}

/// Changes to apply to an existing post. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_draft: Option<bool>,
    /// New slug for the post.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

impl PostChanges {
    /// True when nothing would change.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.body.is_none()
            && self.is_draft.is_none()
            && self.slug.is_none()
    }

    /// Only flip the publication state.
    pub fn publication(is_draft: bool) -> Self {
        Self {
            is_draft: Some(is_draft),
            ..Default::default()
        }
    }

    /// Build the JSON payload containing only the changed keys.
    pub fn payload(&self, today: NaiveDate) -> UpdatePayload<'_> {
        UpdatePayload {
            title: self.title.as_deref(),
            body: self.body.as_deref(),
            published_at: self
                .is_draft
                .map(|is_draft| publication_date(is_draft, today)),
            slug: self.slug.as_deref(),
        }
    }
}

/// Request body for creating a post.
#[derive(Debug, Serialize)]
pub struct CreatePayload<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub published_at: Option<String>,
}

/// Request body for updating a post.
///
/// `published_at: Some(None)` serializes as `null`, turning the post back
/// into a draft.
#[derive(Debug, Serialize)]
pub struct UpdatePayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<&'a str>,
}

/// What the API reports back after a create or update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PostReceipt {
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

fn publication_date(is_draft: bool, today: NaiveDate) -> Option<String> {
    if is_draft {
        None
    } else {
        Some(today.format(DATE_FORMAT).to_string())
    }
}
