//! Error taxonomy for the crawler.
//!
//! Errors fall into a few categories with different handling:
//! host errors and protocol errors are recorded in the snapshot and the
//! worker moves on; cancellation rolls the transaction back quietly;
//! fatal errors are posted to the fatal channel and shut the process down.

use thiserror::Error;

/// Terminal snapshot error recorded when a URL matches the blacklist.
pub const BLACKLIST_MATCH: &str = "black list match";

/// Terminal snapshot error recorded when a URL matches a robots.txt rule.
pub const ROBOTS_MATCH: &str = "robots match";

#[derive(Debug, Error)]
pub enum CrawlError {
    /// The input could not be parsed as a crawlable URL.
    #[error("invalid URL: {0}")]
    Url(String),

    /// Network, DNS, TLS or IO failure tied to a specific remote.
    /// Recorded in the snapshot; the worker continues.
    #[error("{0}")]
    Host(String),

    /// The Gemini server answered with a non-success status.
    #[error("gemini error: code {code} {message}")]
    Gemini {
        code: i32,
        header: String,
        message: String,
    },

    /// The Gopher server answered with an item-type 3 error line.
    #[error("gopher error: {0}")]
    Gopher(String),

    /// The request context was cancelled or its deadline passed.
    #[error("request cancelled or timed out")]
    Cancelled,

    /// Database failure. Treated as fatal: the store is the one resource
    /// the crawler cannot run without.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Unusable configuration or a broken invariant.
    #[error("{0}")]
    Fatal(String),
}

impl CrawlError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlError::Fatal(_) | CrawlError::Db(_))
    }

    pub fn is_host(&self) -> bool {
        matches!(self, CrawlError::Host(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CrawlError::Cancelled)
    }

    pub fn is_gemini(&self) -> bool {
        matches!(self, CrawlError::Gemini { .. })
    }
}

/// Builds the protocol error for a non-success Gemini status code.
/// Status ranges follow the Gemini protocol specification:
/// 1x input, 3x redirect, 4x temporary failure, 5x permanent failure,
/// 6x client certificate.
pub fn gemini_error(code: i32, header: &str) -> CrawlError {
    let message = match code {
        10..=19 => format!("input required: {header}"),
        30..=39 => format!("redirect: {header}"),
        40..=49 => format!("request failed: {header}"),
        50..=59 => format!("server error: {header}"),
        60..=69 => format!("TLS error: {header}"),
        _ => format!("unexpected status code {code}: {header}"),
    };
    CrawlError::Gemini {
        code,
        header: header.to_string(),
        message,
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_error_ranges() {
        let err = gemini_error(31, "31 gemini://elsewhere.gr/");
        match &err {
            CrawlError::Gemini { code, message, .. } => {
                assert_eq!(*code, 31);
                assert!(message.starts_with("redirect:"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(!err.is_fatal());
        assert!(err.is_gemini());
    }

    #[test]
    fn test_gemini_error_out_of_range() {
        let err = gemini_error(99, "99");
        match err {
            CrawlError::Gemini { message, .. } => {
                assert!(message.contains("unexpected status code 99"))
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_classification_helpers() {
        assert!(CrawlError::Fatal("no store".into()).is_fatal());
        assert!(CrawlError::Host("connection refused".into()).is_host());
        assert!(CrawlError::Cancelled.is_cancelled());
        assert!(!CrawlError::Gopher("3 not found".into()).is_fatal());
    }
}
