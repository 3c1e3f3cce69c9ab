//! In-process mutual exclusion per remote host.
//!
//! The pool guarantees at most one in-flight fetch per hostname across all
//! workers in this process. Acquisition polls; release happens after a
//! short random delay so back-to-back fetches to the same host are spaced
//! out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct HostPool {
    hosts: Mutex<HashSet<String>>,
}

/// Holds a host slot; dropping it schedules the release.
pub struct HostGuard {
    pool: Arc<HostPool>,
    host: String,
}

impl HostPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks until no other worker is fetching from `host`, then claims
    /// the slot. Returns promptly with `Cancelled` when the context dies.
    pub async fn acquire(self: &Arc<Self>, ctx: &RequestContext, host: &str) -> Result<HostGuard> {
        loop {
            ctx.checkpoint()?;
            if self.try_insert(host) {
                tracing::debug!(host, "acquired host pool slot");
                return Ok(HostGuard {
                    pool: Arc::clone(self),
                    host: host.to_string(),
                });
            }
            tracing::debug!(host, "another worker is visiting this host, waiting");
            ctx.sleep(Duration::from_millis(Config::HOST_POOL_POLL_MS))
                .await?;
        }
    }

    fn try_insert(&self, host: &str) -> bool {
        self.hosts.lock().insert(host.to_string())
    }

    /// True while some worker holds the slot for `host`.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.lock().contains(host)
    }

    fn remove(&self, host: &str) {
        self.hosts.lock().remove(host);
    }
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        let pool = Arc::clone(&self.pool);
        let host = std::mem::take(&mut self.host);
        // Delay the release a little so fetches to the same host are not
        // issued back to back.
        let jitter =
            rand::thread_rng().gen_range(0..=Config::HOST_POOL_RELEASE_JITTER_MS);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            pool.remove(&host);
            tracing::debug!(host = %host, "released host pool slot");
        });
    }
}
