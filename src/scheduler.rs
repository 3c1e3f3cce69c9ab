//! The scheduler: a single long-running task that drains the queue into
//! the bounded job channel.
//!
//! Each iteration runs in short transactions: count or select pending
//! hosts, claim a handful of random URLs per host, commit, dispatch, then
//! wait for every dispatched worker to finish before polling again. When
//! the queue runs dry it backfills stale root URLs from snapshot history.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::context::RequestContext;
use crate::engine::{Engine, Job};
use crate::error::Result;

pub async fn run_scheduler(engine: Arc<Engine>, jobs_tx: mpsc::Sender<Job>) {
    if let Err(err) = scheduler_loop(&engine, &jobs_tx).await {
        engine.report_fatal(err);
    }
}

async fn scheduler_loop(engine: &Arc<Engine>, jobs_tx: &mpsc::Sender<Job>) -> Result<()> {
    let ctx = RequestContext::background("scheduler");

    // Seed the queue when it starts out empty.
    let mut tx = engine.store.begin().await?;
    let pending = engine.store.count_pending(&ctx, &mut tx).await?;
    tx.commit().await?;

    if pending == 0 {
        tracing::info!("queue is empty, enqueueing seed URLs");
        let mut tx = engine.store.begin().await?;
        for url in engine.seeds.urls() {
            engine.store.insert_url(&ctx, &mut tx, url).await?;
        }
        tx.commit().await?;
    } else {
        tracing::info!(pending, "found pending URLs to crawl");
    }

    loop {
        tracing::debug!("polling queue for jobs");

        // Fresh context per iteration so long scheduler life never bleeds
        // into the transaction handling.
        let ctx = RequestContext::background("scheduler");
        let mut tx = engine.store.begin().await?;

        let mut hosts = engine.store.url_hosts(&ctx, &mut tx).await?;

        if hosts.is_empty() {
            let inserted = backfill_from_history(engine, &ctx, &mut tx).await?;
            if inserted == 0 {
                tx.commit().await?;
                tracing::info!("no work, waiting to poll the queue");
                tokio::time::sleep(Duration::from_secs(Config::IDLE_SLEEP_SECS)).await;
                continue;
            }
            hosts = engine.store.url_hosts(&ctx, &mut tx).await?;
        }

        let urls = engine
            .store
            .pick_random_urls(&ctx, &mut tx, &hosts, Config::URLS_PER_HOST)
            .await?;
        tx.commit().await?;

        if urls.is_empty() {
            tracing::info!("no work, waiting to poll the queue");
            tokio::time::sleep(Duration::from_secs(Config::IDLE_SLEEP_SECS)).await;
            continue;
        }

        tracing::info!(
            hosts = hosts.len(),
            urls = urls.len(),
            "queueing URLs to crawl"
        );

        // Dispatch the batch and wait for every worker to signal back
        // before the next poll.
        let total = urls.len();
        let (done_tx, mut done_rx) = mpsc::channel::<()>(total);
        for url in urls {
            let job = Job {
                url,
                done: done_tx.clone(),
            };
            if jobs_tx.send(job).await.is_err() {
                tracing::warn!("job channel closed, scheduler exiting");
                return Ok(());
            }
        }
        drop(done_tx);

        let mut completed = 0;
        while completed < total {
            if done_rx.recv().await.is_none() {
                break;
            }
            completed += 1;
        }
        tracing::debug!("all workers done, new scheduler run starts");
    }
}

/// Re-enqueues stale root URLs from snapshot history. Returns how many
/// URLs were inserted.
async fn backfill_from_history(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    tx: &mut crate::store::StoreTx,
) -> Result<usize> {
    let days = engine.config.skip_if_updated_days.max(0);
    let cutoff = Utc::now() - chrono::Duration::days(days);
    let limit = (engine.config.workers * Config::BACKFILL_URLS_PER_WORKER) as i64;

    tracing::debug!(limit, days, "looking for stale URLs to recrawl");
    let stale = engine.store.fetch_history(ctx, tx, cutoff, limit).await?;
    if stale.is_empty() {
        return Ok(0);
    }

    let mut inserted = 0;
    for row in &stale {
        engine.store.insert_url(ctx, tx, &row.url).await?;
        inserted += 1;
    }
    tracing::info!(inserted, "added old URLs to the recrawl queue");
    Ok(inserted)
}
