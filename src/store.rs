//! PostgreSQL-backed queue and snapshot archive.
//!
//! The `urls` table is the crawl queue; `snapshots` is the append-only
//! fetch history. Every operation here runs inside a caller-owned
//! transaction so the worker pipeline commits or rolls back one URL's
//! work atomically. Queue rows are claimed with `FOR UPDATE SKIP LOCKED`
//! plus an advisory `being_processed` flag.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{CrawlError, Result};
use crate::snapshot::{LinkList, Snapshot};
use crate::url::GemUrl;

pub type StoreTx = sqlx::Transaction<'static, sqlx::Postgres>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS urls (
    id BIGSERIAL PRIMARY KEY,
    url TEXT NOT NULL UNIQUE,
    host TEXT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
    being_processed BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS urls_host_idx ON urls (host);
CREATE INDEX IF NOT EXISTS urls_being_processed_idx ON urls (being_processed);

CREATE TABLE IF NOT EXISTS snapshots (
    id BIGSERIAL PRIMARY KEY,
    url TEXT NOT NULL,
    host TEXT NOT NULL,
    timestamp TIMESTAMPTZ,
    mimetype TEXT,
    data BYTEA,
    gemtext TEXT,
    header TEXT,
    links JSONB,
    lang TEXT,
    response_code INTEGER,
    error TEXT,
    last_crawled TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS snapshots_url_idx ON snapshots (url);
CREATE INDEX IF NOT EXISTS snapshots_url_timestamp_idx ON snapshots (url, timestamp DESC);
CREATE INDEX IF NOT EXISTS snapshots_host_idx ON snapshots (host);
"#;

/// Row shape shared by the snapshot queries.
#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: i64,
    url: String,
    host: String,
    timestamp: Option<DateTime<Utc>>,
    mimetype: Option<String>,
    data: Option<Vec<u8>>,
    gemtext: Option<String>,
    header: Option<String>,
    links: Option<serde_json::Value>,
    lang: Option<String>,
    response_code: Option<i32>,
    error: Option<String>,
    last_crawled: Option<DateTime<Utc>>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = CrawlError;

    fn try_from(row: SnapshotRow) -> Result<Snapshot> {
        let url = GemUrl::parse(&row.url, "", false)?;
        let links = match row.links {
            Some(value) => Some(
                serde_json::from_value::<LinkList>(value)
                    .map_err(|e| CrawlError::Fatal(format!("corrupt links column: {e}")))?,
            ),
            None => None,
        };
        Ok(Snapshot {
            id: row.id,
            host: row.host,
            url,
            timestamp: row.timestamp,
            mime_type: row.mimetype,
            data: row.data,
            gemtext: row.gemtext,
            header: row.header,
            links,
            lang: row.lang,
            response_code: row.response_code,
            error: row.error,
            last_crawled: row.last_crawled,
        })
    }
}

/// A stale root URL selected for re-crawling.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryUrl {
    pub url: String,
    pub host: String,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    dry_run: bool,
    gopher_enabled: bool,
    skip_if_updated_days: i64,
}

impl Store {
    /// Connects, bootstraps the schema, and clears stale processing flags
    /// left behind by a previous run.
    pub async fn connect(config: &Config) -> Result<Store> {
        tracing::debug!("connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_db_connections)
            .connect(&config.pgurl)
            .await
            .map_err(|e| {
                CrawlError::Fatal(format!("unable to connect to database: {e}"))
            })?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| CrawlError::Fatal(format!("schema setup failed: {e}")))?;

        let store = Store {
            pool,
            dry_run: config.dry_run,
            gopher_enabled: config.gopher_enabled,
            skip_if_updated_days: config.skip_if_updated_days,
        };
        store.clear_processing_flags().await?;
        tracing::debug!("database connection initialized");
        Ok(store)
    }

    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(self.pool.begin().await?)
    }

    /// Rolls a transaction back, logging instead of failing the caller for
    /// expected outcomes. Ownership makes a double rollback impossible, so
    /// the only real failure mode is a broken connection.
    pub async fn safe_rollback(tx: StoreTx) -> Result<()> {
        match tx.rollback().await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(error = %err, "failed to roll back transaction");
                Err(CrawlError::Db(err))
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.clear_processing_flags().await {
            tracing::error!(error = %err, "could not clear processing flags on shutdown");
        }
        self.pool.close().await;
        tracing::debug!("database connection closed");
    }

    async fn clear_processing_flags(&self) -> Result<()> {
        sqlx::query("UPDATE urls SET being_processed = FALSE WHERE being_processed")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upserts a URL into the queue, keyed by its canonical form.
    pub async fn insert_url(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        url: &str,
    ) -> Result<()> {
        ctx.checkpoint()?;
        let normalized = GemUrl::parse(url, "", true)?;
        tracing::debug!(url = %normalized.full, "inserting URL into queue");
        sqlx::query(
            "INSERT INTO urls (url, host, timestamp) VALUES ($1, $2, now())
             ON CONFLICT (url) DO NOTHING",
        )
        .bind(&normalized.full)
        .bind(&normalized.host)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn delete_url(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        url: &str,
    ) -> Result<()> {
        ctx.checkpoint()?;
        tracing::debug!(url, "removing URL from queue");
        sqlx::query("DELETE FROM urls WHERE url = $1")
            .bind(url)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Renames a queue row to its canonical form, unless a row for the
    /// canonical form already exists (then this is a no-op).
    pub async fn update_url(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        url: &str,
        normalized: &str,
    ) -> Result<()> {
        if url == normalized {
            return Ok(());
        }
        ctx.checkpoint()?;
        tracing::debug!(url, normalized, "renaming queue URL to canonical form");
        sqlx::query(
            "UPDATE urls SET url = $2
             WHERE url = $1
               AND NOT EXISTS (SELECT 1 FROM urls WHERE url = $2)",
        )
        .bind(url)
        .bind(normalized)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Number of pending URLs, restricted to Gemini when Gopher is off.
    pub async fn count_pending(&self, ctx: &RequestContext, tx: &mut StoreTx) -> Result<i64> {
        ctx.checkpoint()?;
        let query = if self.gopher_enabled {
            "SELECT COUNT(*) FROM urls"
        } else {
            "SELECT COUNT(*) FROM urls WHERE url LIKE 'gemini://%'"
        };
        let count: i64 = sqlx::query_scalar(query).fetch_one(&mut **tx).await?;
        Ok(count)
    }

    /// Distinct hosts that still have claimable pending URLs.
    pub async fn url_hosts(&self, ctx: &RequestContext, tx: &mut StoreTx) -> Result<Vec<String>> {
        ctx.checkpoint()?;
        let query = if self.gopher_enabled {
            "SELECT DISTINCT(host) FROM urls WHERE being_processed IS NOT TRUE"
        } else {
            "SELECT DISTINCT(host) FROM urls
             WHERE url LIKE 'gemini://%' AND being_processed IS NOT TRUE"
        };
        let hosts: Vec<String> = sqlx::query_scalar(query).fetch_all(&mut **tx).await?;
        Ok(hosts)
    }

    /// Claims up to `limit` random pending URLs per host: rows are locked
    /// with SKIP LOCKED and flagged as being processed before the
    /// transaction commits, so no two workers receive the same URL.
    pub async fn pick_random_urls(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        hosts: &[String],
        limit: i64,
    ) -> Result<Vec<String>> {
        ctx.checkpoint()?;
        let query = if self.gopher_enabled {
            "SELECT url FROM urls
             WHERE host = $1 AND being_processed IS NOT TRUE
             ORDER BY RANDOM() LIMIT $2
             FOR UPDATE SKIP LOCKED"
        } else {
            "SELECT url FROM urls
             WHERE host = $1 AND url LIKE 'gemini://%' AND being_processed IS NOT TRUE
             ORDER BY RANDOM() LIMIT $2
             FOR UPDATE SKIP LOCKED"
        };

        let mut urls: Vec<String> = Vec::new();
        for host in hosts {
            ctx.checkpoint()?;
            let picked: Vec<String> = sqlx::query_scalar(query)
                .bind(host)
                .bind(limit)
                .fetch_all(&mut **tx)
                .await?;
            urls.extend(picked);
        }

        self.mark_being_processed(ctx, tx, &urls).await?;
        Ok(urls)
    }

    async fn mark_being_processed(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        urls: &[String],
    ) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }
        ctx.checkpoint()?;
        tracing::debug!(count = urls.len(), "marking URLs as being processed");
        sqlx::query("UPDATE urls SET being_processed = TRUE WHERE url = ANY($1)")
            .bind(urls)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Inserts a new snapshot row, stamping capture time and last_crawled,
    /// and sets the store-assigned id on return. In dry-run mode the
    /// snapshot is logged instead of written.
    pub async fn save_snapshot(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        snapshot: &mut Snapshot,
    ) -> Result<()> {
        ctx.checkpoint()?;

        if self.dry_run {
            let serialized = serde_json::to_string_pretty(snapshot)
                .map_err(|e| CrawlError::Fatal(format!("snapshot serialization: {e}")))?;
            tracing::info!(url = %snapshot.url, "dry run, would save snapshot:\n{serialized}");
            return Ok(());
        }

        let now = Utc::now();
        snapshot.timestamp = Some(now);
        snapshot.last_crawled = Some(now);

        let links = snapshot
            .links
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CrawlError::Fatal(format!("links serialization: {e}")))?;

        let row = sqlx::query(
            "INSERT INTO snapshots
                 (url, host, timestamp, mimetype, data, gemtext, links, lang,
                  response_code, error, header, last_crawled)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING id",
        )
        .bind(&snapshot.url.full)
        .bind(&snapshot.host)
        .bind(snapshot.timestamp)
        .bind(&snapshot.mime_type)
        .bind(&snapshot.data)
        .bind(&snapshot.gemtext)
        .bind(links)
        .bind(&snapshot.lang)
        .bind(snapshot.response_code)
        .bind(&snapshot.error)
        .bind(&snapshot.header)
        .bind(snapshot.last_crawled)
        .fetch_one(&mut **tx)
        .await?;

        snapshot.id = row.try_get("id")?;
        tracing::debug!(url = %snapshot.url, id = snapshot.id, "snapshot saved");
        Ok(())
    }

    /// Most recent snapshot for a URL, by capture time.
    pub async fn get_latest_snapshot(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        url: &str,
    ) -> Result<Option<Snapshot>> {
        ctx.checkpoint()?;
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM snapshots WHERE url = $1 ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Snapshot::try_from).transpose()
    }

    /// Bumps `last_crawled` on the latest row for a URL. Used when a fetch
    /// produced content identical to what is already archived.
    pub async fn update_last_crawled(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        url: &str,
    ) -> Result<()> {
        ctx.checkpoint()?;
        tracing::debug!(url, "updating last_crawled on latest snapshot");
        sqlx::query(
            "UPDATE snapshots SET last_crawled = now()
             WHERE id = (SELECT id FROM snapshots
                         WHERE url = $1 ORDER BY timestamp DESC LIMIT 1)",
        )
        .bind(url)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Compares the populated body of `snapshot` against the latest stored
    /// snapshot for the same URL, field against matching field.
    pub async fn is_content_identical(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        snapshot: &Snapshot,
    ) -> Result<bool> {
        let Some(latest) = self
            .get_latest_snapshot(ctx, tx, &snapshot.url.full)
            .await?
        else {
            return Ok(false);
        };
        ctx.checkpoint()?;

        if let (Some(new), Some(old)) = (&snapshot.gemtext, &latest.gemtext) {
            return Ok(new == old);
        }
        if let (Some(new), Some(old)) = (&snapshot.data, &latest.data) {
            return Ok(new == old);
        }
        Ok(false)
    }

    /// True when the queue already holds this URL.
    pub async fn already_queued(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        url: &str,
    ) -> Result<bool> {
        ctx.checkpoint()?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM urls WHERE url = $1)")
                .bind(url)
                .fetch_one(&mut **tx)
                .await?;
        Ok(exists)
    }

    /// True when a snapshot for this URL exists inside the configured
    /// skip window. Disabled when the window is zero.
    pub async fn recently_crawled(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        url: &str,
    ) -> Result<bool> {
        if self.skip_if_updated_days <= 0 {
            return Ok(false);
        }
        ctx.checkpoint()?;
        let cutoff = Utc::now() - chrono::Duration::days(self.skip_if_updated_days);
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM snapshots WHERE url = $1 AND timestamp > $2)",
        )
        .bind(url)
        .bind(cutoff)
        .fetch_one(&mut **tx)
        .await?;
        Ok(exists)
    }

    /// Stale root URLs for the scheduler's backfill: roots whose latest
    /// crawl predates the cutoff and whose latest capture was a successful
    /// Gemini document, one random URL per host, up to `limit`.
    pub async fn fetch_history(
        &self,
        ctx: &RequestContext,
        tx: &mut StoreTx,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<HistoryUrl>> {
        ctx.checkpoint()?;
        let rows: Vec<HistoryUrl> = sqlx::query_as(
            "WITH latest AS (
                 SELECT DISTINCT ON (url)
                        url, host, last_crawled, response_code, gemtext
                 FROM snapshots
                 ORDER BY url, timestamp DESC
             ),
             stale AS (
                 SELECT url, host FROM latest
                 WHERE url ~ '^gemini://[^/]+/?$'
                   AND (last_crawled IS NULL OR last_crawled < $1)
                   AND response_code >= 20 AND response_code < 30
                   AND gemtext IS NOT NULL
             ),
             ranked AS (
                 SELECT url, host,
                        ROW_NUMBER() OVER (PARTITION BY host ORDER BY RANDOM()) AS rn
                 FROM stale
             )
             SELECT url, host FROM ranked WHERE rn = 1
             ORDER BY RANDOM() LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_row_conversion() {
        let row = SnapshotRow {
            id: 7,
            url: "gemini://example.com:1965/a".to_string(),
            host: "example.com".to_string(),
            timestamp: Some(Utc::now()),
            mimetype: Some("text/gemini".to_string()),
            data: None,
            gemtext: Some("# hi\n".to_string()),
            header: Some("20 text/gemini".to_string()),
            links: Some(serde_json::json!([
                {"scheme": "gemini", "host": "example.com", "port": 1965,
                 "path": "/b", "full": "gemini://example.com:1965/b"}
            ])),
            lang: None,
            response_code: Some(20),
            error: None,
            last_crawled: Some(Utc::now()),
        };
        let snapshot = Snapshot::try_from(row).unwrap();
        assert_eq!(snapshot.id, 7);
        assert_eq!(snapshot.url.full, "gemini://example.com:1965/a");
        let links = snapshot.links.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].full, "gemini://example.com:1965/b");
    }

    #[test]
    fn test_snapshot_row_bad_url_rejected() {
        let row = SnapshotRow {
            id: 1,
            url: "not a url".to_string(),
            host: "example.com".to_string(),
            timestamp: None,
            mimetype: None,
            data: None,
            gemtext: None,
            header: None,
            links: None,
            lang: None,
            response_code: None,
            error: None,
            last_crawled: None,
        };
        assert!(Snapshot::try_from(row).is_err());
    }
}
