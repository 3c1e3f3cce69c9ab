//! The engine owns every shared subsystem: configuration, store, policy
//! lists, robots cache and host pool. It is composed once at startup and
//! handed to the scheduler and workers by reference.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{CrawlError, Result};
use crate::host_pool::HostPool;
use crate::lists::{PatternList, SeedList};
use crate::robots::RobotsCache;
use crate::store::Store;
use crate::worker;

/// One unit of work handed from the scheduler to a worker. The worker
/// signals on `done` when it finishes, success or not.
pub struct Job {
    pub url: String,
    pub done: mpsc::Sender<()>,
}

pub struct Engine {
    pub config: Config,
    pub store: Store,
    pub blacklist: PatternList,
    pub whitelist: PatternList,
    pub seeds: SeedList,
    pub robots: RobotsCache,
    pub host_pool: Arc<HostPool>,
    fatal_tx: mpsc::UnboundedSender<CrawlError>,
}

impl Engine {
    /// Loads the policy lists, connects the store, and enqueues the seed
    /// file if one was given. Returns the engine plus the receiving end
    /// of the fatal-error channel.
    pub async fn initialize(
        config: Config,
    ) -> Result<(Arc<Engine>, mpsc::UnboundedReceiver<CrawlError>)> {
        let blacklist = PatternList::load(config.blacklist_path.as_deref())?;
        if !blacklist.is_empty() {
            tracing::info!(entries = blacklist.len(), "loaded blacklist");
        }
        let whitelist = PatternList::load(config.whitelist_path.as_deref())?;
        if !whitelist.is_empty() {
            tracing::info!(entries = whitelist.len(), "loaded whitelist");
        }
        let seeds = SeedList::load(config.seed_url_path.as_deref())?;

        let store = Store::connect(&config).await?;

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Engine {
            config,
            store,
            blacklist,
            whitelist,
            seeds,
            robots: RobotsCache::new(),
            host_pool: HostPool::new(),
            fatal_tx,
        });

        engine.enqueue_seed_file().await?;
        Ok((engine, fatal_rx))
    }

    /// Posts an unrecoverable error; the main loop shuts down on receipt.
    pub fn report_fatal(&self, err: CrawlError) {
        let _ = self.fatal_tx.send(err);
    }

    /// Spawns the long-lived worker tasks and returns the bounded job
    /// channel feeding them. Channel capacity equals the worker count.
    pub fn spawn_workers(self: &Arc<Self>) -> mpsc::Sender<Job> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(self.config.workers);
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));

        tracing::info!(count = self.config.workers, "spawning workers");
        for worker_id in 0..self.config.workers {
            let engine = Arc::clone(self);
            let jobs_rx = Arc::clone(&jobs_rx);
            tokio::spawn(async move {
                loop {
                    let job = { jobs_rx.lock().await.recv().await };
                    let Some(job) = job else {
                        break;
                    };
                    worker::run_worker(&engine, worker_id, &job.url).await;
                    let _ = job.done.send(()).await;
                }
            });
        }
        jobs_tx
    }

    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }

    /// Inserts the URLs from the seed file into the queue right away, so
    /// an operator-supplied seed set takes effect without waiting for the
    /// scheduler to find an empty queue.
    async fn enqueue_seed_file(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Ok(());
        }
        let ctx = RequestContext::background("seed");
        let mut tx = self.store.begin().await?;
        for url in self.seeds.urls() {
            tracing::info!(url = %url, "adding seed URL to queue");
            self.store.insert_url(&ctx, &mut tx, url).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
