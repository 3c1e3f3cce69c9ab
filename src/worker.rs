//! Per-URL worker pipeline.
//!
//! One job is one URL string. The worker runs the whole pipeline inside a
//! single transaction: filter, dedupe, fetch, parse, persist links,
//! persist snapshot. Expected errors (host, protocol, policy) end up
//! inside the saved snapshot; cancellation rolls back quietly; everything
//! else is fatal.

use std::sync::Arc;

use tracing::Instrument;

use crate::context::RequestContext;
use crate::engine::Engine;
use crate::error::{CrawlError, Result, BLACKLIST_MATCH, ROBOTS_MATCH};
use crate::snapshot::Snapshot;
use crate::store::{Store, StoreTx};
use crate::url::{self, GemUrl};
use crate::{gemini, gopher};

/// Entry point for one job. Never returns an error: failures are either
/// recorded, rolled back, or posted to the fatal channel.
pub async fn run_worker(engine: &Arc<Engine>, worker_id: usize, job: &str) {
    let parsed = match GemUrl::parse(job, "", true) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::info!(job, error = %err, "failed to parse job URL, dropping");
            return;
        }
    };

    let ctx = RequestContext::new(job, &parsed.host, worker_id);
    let span = ctx.span();
    run_with_tx(engine, &ctx, job).instrument(span).await;
}

async fn run_with_tx(engine: &Arc<Engine>, ctx: &RequestContext, job: &str) {
    tracing::debug!("starting worker for URL");

    let mut tx = match engine.store.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            engine.report_fatal(err);
            return;
        }
    };

    match work_on_url(engine, ctx, &mut tx, job).await {
        Ok(()) => {
            tracing::debug!("committing transaction");
            if let Err(err) = tx.commit().await {
                tracing::error!(error = %err, "failed to commit transaction");
                engine.report_fatal(CrawlError::Db(err));
            }
        }
        Err(CrawlError::Cancelled) => {
            // Not fatal: roll back and let the worker pick up the next job.
            tracing::debug!("worker timed out or was cancelled");
            if let Err(rollback_err) = Store::safe_rollback(tx).await {
                engine.report_fatal(rollback_err);
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "worker failed");
            if let Err(rollback_err) = Store::safe_rollback(tx).await {
                engine.report_fatal(rollback_err);
            }
            engine.report_fatal(err);
        }
    }
    tracing::debug!("worker done");
}

/// Visits one URL and stores the result. Expected errors are recorded in
/// the snapshot; only cancellation and fatal conditions are returned.
pub async fn work_on_url(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    tx: &mut StoreTx,
    job: &str,
) -> Result<()> {
    tracing::debug!(job, "processing URL");

    let mut snapshot = Snapshot::from_url(job, true)?;

    let is_gemini = url::is_gemini_url(&snapshot.url.full);
    let is_gopher = url::is_gopher_url(&snapshot.url.full);

    if !is_gemini && !is_gopher {
        tracing::info!(job, "not a Gemini or Gopher URL, dropping");
        return engine.store.delete_url(ctx, tx, job).await;
    }
    if is_gopher && !engine.config.gopher_enabled {
        tracing::debug!(job, "gopher URL with gopher crawling disabled, dropping");
        return engine.store.delete_url(ctx, tx, job).await;
    }

    // Reflect the canonical form in the queue before doing anything else.
    // When a row for the canonical form already exists the rename is a
    // no-op, so drop the stale spelling explicitly.
    if job != snapshot.url.full {
        engine.store.update_url(ctx, tx, job, &snapshot.url.full).await?;
        engine.store.delete_url(ctx, tx, job).await?;
        tracing::debug!(from = job, to = %snapshot.url.full, "normalized URL");
    }
    let canonical = snapshot.url.full.clone();

    let whitelisted = engine.whitelist.matches(&canonical);
    if whitelisted {
        tracing::info!(url = %canonical, "URL matches whitelist, forcing crawl");
    }

    if !whitelisted && engine.blacklist.matches(&canonical) {
        tracing::info!(url = %canonical, "URL matches blacklist, ignoring");
        snapshot.error = Some(BLACKLIST_MATCH.to_string());
        return save_snapshot_and_remove_url(engine, ctx, tx, &mut snapshot).await;
    }

    if !whitelisted && is_gemini {
        let blocked = engine
            .robots
            .matches(ctx, &snapshot.url, &engine.config)
            .await?;
        if blocked {
            tracing::info!(url = %canonical, "URL matches robots.txt, skipping");
            snapshot.error = Some(ROBOTS_MATCH.to_string());
            return save_snapshot_and_remove_url(engine, ctx, tx, &mut snapshot).await;
        }
    }

    tracing::debug!("acquiring host pool slot");
    let _host_slot = engine.host_pool.acquire(ctx, &snapshot.url.host).await?;

    tracing::debug!(url = %canonical, "visiting");
    let mut snapshot = if is_gopher {
        gopher::visit(ctx, &canonical, &engine.config).await?
    } else {
        gemini::visit(ctx, &canonical, &engine.config).await?
    };

    if is_gemini && snapshot.is_redirect() {
        handle_redirect(engine, ctx, tx, &snapshot).await?;
    }

    // Unchanged content: bump last_crawled on the archived row instead of
    // inserting a duplicate.
    if engine.store.is_content_identical(ctx, tx, &snapshot).await? {
        tracing::debug!(url = %canonical, "content identical to latest snapshot");
        engine.store.update_last_crawled(ctx, tx, &canonical).await?;
        return engine.store.delete_url(ctx, tx, &canonical).await;
    }

    if snapshot.links.is_some() {
        store_links(engine, ctx, tx, &snapshot).await?;
    }

    tracing::info!(
        code = snapshot.response_code.unwrap_or_default(),
        url = %canonical,
        "crawled"
    );
    save_snapshot_and_remove_url(engine, ctx, tx, &mut snapshot).await
}

/// Inserts the extracted links that are worth crawling into the queue.
async fn store_links(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    tx: &mut StoreTx,
    snapshot: &Snapshot,
) -> Result<()> {
    let Some(links) = &snapshot.links else {
        return Ok(());
    };
    tracing::debug!(count = links.len(), "found links");

    for link in links {
        if !should_persist_url(&engine.blacklist, engine.config.gopher_enabled, link) {
            continue;
        }
        if have_we_visited_url(engine, ctx, tx, &link.full).await? {
            tracing::debug!(link = %link.full, "link already queued or recently crawled");
            continue;
        }
        tracing::debug!(link = %link.full, "saving link");
        engine.store.insert_url(ctx, tx, &link.full).await?;
    }
    Ok(())
}

/// Enqueues the target of a Gemini redirect when it is worth crawling.
async fn handle_redirect(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    tx: &mut StoreTx,
    snapshot: &Snapshot,
) -> Result<()> {
    let header = snapshot.header.clone().unwrap_or_default();
    let target = match url::extract_redirect_target(&snapshot.url, &header) {
        Ok(target) => target,
        Err(err) => {
            // A malformed redirect header is the server's problem, not ours.
            tracing::info!(header = %header, error = %err, "failed to extract redirect target");
            return Ok(());
        }
    };
    tracing::debug!(target = %target.full, "page redirects");

    if should_persist_url(&engine.blacklist, engine.config.gopher_enabled, &target)
        && !have_we_visited_url(engine, ctx, tx, &target.full).await?
    {
        engine.store.insert_url(ctx, tx, &target.full).await?;
        tracing::debug!(target = %target.full, "saved redirection URL");
    }
    Ok(())
}

async fn save_snapshot_and_remove_url(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    tx: &mut StoreTx,
    snapshot: &mut Snapshot,
) -> Result<()> {
    let url = snapshot.url.full.clone();
    engine.store.save_snapshot(ctx, tx, snapshot).await?;
    engine.store.delete_url(ctx, tx, &url).await
}

/// A URL is worth persisting when it is not blacklisted and uses a
/// protocol this crawl is configured to follow.
pub fn should_persist_url(blacklist: &crate::lists::PatternList, gopher_enabled: bool, u: &GemUrl) -> bool {
    if blacklist.matches(&u.full) {
        return false;
    }
    if gopher_enabled && url::is_gopher_url(&u.full) {
        return true;
    }
    url::is_gemini_url(&u.full)
}

/// True when the URL is already queued, or a snapshot for it exists
/// inside the skip window.
async fn have_we_visited_url(
    engine: &Arc<Engine>,
    ctx: &RequestContext,
    tx: &mut StoreTx,
    u: &str,
) -> Result<bool> {
    if engine.store.already_queued(ctx, tx, u).await? {
        return Ok(true);
    }
    engine.store.recently_crawled(ctx, tx, u).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::PatternList;

    fn gem(url: &str) -> GemUrl {
        GemUrl::parse(url, "", true).unwrap()
    }

    #[test]
    fn test_should_persist_gemini() {
        let blacklist = PatternList::default();
        assert!(should_persist_url(&blacklist, false, &gem("gemini://example.com/")));
    }

    #[test]
    fn test_should_persist_rejects_blacklisted() {
        let blacklist = PatternList::from_content("example\\.com").unwrap();
        assert!(!should_persist_url(&blacklist, false, &gem("gemini://example.com/path")));
        assert!(should_persist_url(&blacklist, false, &gem("gemini://safe-site.com/")));
    }

    #[test]
    fn test_should_persist_gopher_follows_config() {
        let blacklist = PatternList::default();
        assert!(!should_persist_url(&blacklist, false, &gem("gopher://example.com/1/")));
        assert!(should_persist_url(&blacklist, true, &gem("gopher://example.com/1/")));
    }

    #[test]
    fn test_should_persist_rejects_other_schemes() {
        let blacklist = PatternList::default();
        assert!(!should_persist_url(&blacklist, true, &gem("https://example.com/")));
    }
}
