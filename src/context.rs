//! Per-request context threaded through the worker pipeline.
//!
//! Carries the identifiers used for structured logging (request id, worker
//! id, host, url, component) together with a cancellation token and a hard
//! deadline. Every blocking operation in the pipeline checks or races
//! against this context.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{CrawlError, Result};

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub worker_id: usize,
    pub host: String,
    pub url: String,
    pub component: &'static str,
    deadline: Instant,
    token: CancellationToken,
}

impl RequestContext {
    /// New context with the standard per-request deadline.
    pub fn new(url: &str, host: &str, worker_id: usize) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            worker_id,
            host: host.to_string(),
            url: url.to_string(),
            component: "worker",
            deadline: Instant::now() + Duration::from_secs(Config::REQUEST_TIMEOUT_SECS),
            token: CancellationToken::new(),
        }
    }

    /// Context for long-lived tasks (scheduler, startup) that must not
    /// expire on the per-request deadline.
    pub fn background(component: &'static str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            worker_id: 0,
            host: String::new(),
            url: String::new(),
            component,
            deadline: Instant::now() + Duration::from_secs(365 * 24 * 3600),
            token: CancellationToken::new(),
        }
    }

    /// Derived context tagged with another component name. Shares the
    /// deadline and cancellation token of the parent.
    pub fn with_component(&self, component: &'static str) -> Self {
        let mut ctx = self.clone();
        ctx.component = component;
        ctx
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Returns `Err(Cancelled)` when the context is no longer live.
    /// Mirrors the explicit cancellation checks between pipeline steps.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }
        Ok(())
    }

    /// Tracing span carrying the request attributes. Pipeline code runs
    /// inside this span so every log line is attributable.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "request",
            request_id = %self.request_id,
            worker = self.worker_id,
            host = %self.host,
            url = %self.url,
            component = self.component,
        )
    }

    /// Runs a fallible IO future, bounded by both the per-operation limit
    /// and this context. A per-operation timeout is a host error (the
    /// remote was too slow); cancellation and the request deadline map to
    /// `Cancelled`.
    pub async fn io<T, E, F>(&self, limit: Duration, fut: F) -> Result<T>
    where
        E: Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(CrawlError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(CrawlError::Cancelled),
            res = tokio::time::timeout(limit, fut) => match res {
                Err(_) => Err(CrawlError::Host("i/o timeout".to_string())),
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CrawlError::Host(e.to_string())),
            },
        }
    }

    /// Sleeps for `duration` unless the context is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(CrawlError::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(CrawlError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkpoint_live_context() {
        let ctx = RequestContext::new("gemini://example.com:1965/", "example.com", 0);
        assert!(ctx.checkpoint().is_ok());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_checkpoint_after_cancel() {
        let ctx = RequestContext::new("gemini://example.com:1965/", "example.com", 0);
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.checkpoint(), Err(CrawlError::Cancelled)));
    }

    #[tokio::test]
    async fn test_component_shares_cancellation() {
        let ctx = RequestContext::new("gemini://example.com:1965/", "example.com", 3);
        let derived = ctx.with_component("network");
        ctx.cancel();
        assert!(derived.is_cancelled());
        assert_eq!(derived.worker_id, 3);
        assert_eq!(derived.component, "network");
    }

    #[tokio::test]
    async fn test_io_maps_slow_operation_to_host_error() {
        let ctx = RequestContext::new("gemini://example.com:1965/", "example.com", 0);
        let result: Result<()> = ctx
            .io(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), std::io::Error>(())
            })
            .await;
        assert!(matches!(result, Err(CrawlError::Host(_))));
    }

    #[tokio::test]
    async fn test_io_cancelled_wins() {
        let ctx = RequestContext::new("gemini://example.com:1965/", "example.com", 0);
        ctx.cancel();
        let result: Result<()> = ctx
            .io(Duration::from_secs(1), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), std::io::Error>(())
            })
            .await;
        assert!(matches!(result, Err(CrawlError::Cancelled)));
    }
}
