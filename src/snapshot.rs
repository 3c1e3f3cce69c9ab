//! The snapshot model: one immutable record per fetch attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::url::GemUrl;

/// Ordered list of links extracted from one document. Stored as JSON.
pub type LinkList = Vec<GemUrl>;

/// An immutable record of one fetch attempt against one URL.
///
/// Exactly one of `data` / `gemtext` is set when a body was received;
/// `error` is set iff no usable body was produced or a protocol or host
/// error occurred. Rows are never mutated after insertion; only
/// `last_crawled` on the latest row is bumped when content is unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    pub url: GemUrl,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Body for non-`text/gemini` responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    /// Body for `text/gemini` responses and Gopher text, valid UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemtext: Option<String>,
    /// The raw response status line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<LinkList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<i32>,
    /// Human-readable terminal error captured during the fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the URL was last processed, regardless of content changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_crawled: Option<DateTime<Utc>>,
}

fn is_zero(id: &i64) -> bool {
    *id == 0
}

impl Snapshot {
    /// Fresh snapshot for a URL about to be fetched.
    pub fn from_url(input: &str, normalize: bool) -> Result<Snapshot> {
        let url = GemUrl::parse(input, "", normalize)?;
        Ok(Snapshot {
            host: url.host.clone(),
            timestamp: Some(Utc::now()),
            url,
            ..Snapshot::default()
        })
    }

    /// Whether this snapshot is a successfully fetched Gemini document.
    pub fn is_gemini_capsule(&self) -> bool {
        self.error.is_none()
            && self.mime_type.as_deref() == Some("text/gemini")
            && self.gemtext.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Whether the response was a Gemini redirect.
    pub fn is_redirect(&self) -> bool {
        matches!(self.response_code, Some(code) if (30..40).contains(&code))
    }
}
