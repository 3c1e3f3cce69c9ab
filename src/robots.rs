//! Per-host robots.txt cache for Gemini.
//!
//! Keyed by lowercased `host:port`. The cached value is the final list of
//! disallowed URL prefixes; an empty list is a valid entry meaning nothing
//! is disallowed (or no robots.txt exists) and prevents refetching. Only a
//! fetch that was cancelled leaves the key unpopulated so the host can be
//! retried later.

use dashmap::DashMap;

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{CrawlError, Result};
use crate::gemini;
use crate::snapshot::Snapshot;
use crate::url::GemUrl;

#[derive(Debug, Default)]
pub struct RobotsCache {
    entries: DashMap<String, Vec<String>>,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `url` is blocked by the host's robots.txt. Populates the
    /// cache on first use per host. Robots applies to Gemini only; the
    /// caller gates on that.
    pub async fn matches(
        &self,
        ctx: &RequestContext,
        url: &GemUrl,
        config: &Config,
    ) -> Result<bool> {
        let ctx = ctx.with_component("robots");
        let key = url.host_key().to_lowercase();

        // Clone out of the map guard before any await, so the populate
        // path is free to insert into the same shard.
        let cached = self.entries.get(&key).map(|entry| entry.value().clone());
        let disallowed = match cached {
            Some(entries) => {
                tracing::debug!(key = %key, rules = entries.len(), "robots cache hit");
                entries
            }
            None => {
                tracing::debug!(key = %key, "robots cache miss, fetching robots.txt");
                self.populate(&ctx, &key, config).await?
            }
        };

        Ok(is_url_blocked(&disallowed, &url.full))
    }

    /// Fetches and parses `robots.txt` for `key`, caching the resulting
    /// rule list. Cancellation is propagated without caching; any other
    /// fetch problem caches an empty list so the host is not hammered.
    async fn populate(
        &self,
        ctx: &RequestContext,
        key: &str,
        config: &Config,
    ) -> Result<Vec<String>> {
        let robots_url = GemUrl::parse(&format!("gemini://{key}/robots.txt"), "", true)?;

        let data = match gemini::connect_and_get_data(ctx, &robots_url, config).await {
            Ok(data) => data,
            Err(CrawlError::Cancelled) => {
                // Leave the key unpopulated so a later attempt can retry.
                tracing::debug!(key = %key, "robots.txt fetch cancelled, not caching");
                return Err(CrawlError::Cancelled);
            }
            Err(err) => {
                tracing::debug!(key = %key, error = %err, "robots.txt fetch failed, caching empty");
                self.entries.insert(key.to_string(), Vec::new());
                return Ok(Vec::new());
            }
        };

        let mut snapshot = Snapshot::from_url(&robots_url.full, true)?;
        gemini::apply_response(&mut snapshot, &data, config.max_response_size);

        let entries = rules_from_snapshot(&snapshot, key);
        if entries.is_empty() {
            tracing::debug!(key = %key, "no disallow rules");
        } else {
            tracing::debug!(key = %key, rules = entries.len(), "cached disallow rules");
        }
        self.entries.insert(key.to_string(), entries.clone());
        Ok(entries)
    }

    #[cfg(test)]
    fn insert_for_test(&self, key: &str, entries: Vec<String>) {
        self.entries.insert(key.to_string(), entries);
    }

    #[cfg(test)]
    fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Rules only come from a successful response with a text mime type.
/// Robots served any other way cache as empty.
fn rules_from_snapshot(snapshot: &Snapshot, key: &str) -> Vec<String> {
    if snapshot.response_code != Some(20) {
        return Vec::new();
    }
    let content = match snapshot.mime_type.as_deref() {
        Some("text/plain") => match &snapshot.data {
            Some(data) => String::from_utf8_lossy(data).into_owned(),
            None => return Vec::new(),
        },
        Some("text/gemini") => match &snapshot.gemtext {
            Some(text) => text.clone(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    parse_robots_txt(&content, key)
}

/// Permissive robots.txt parse: every `disallow:` line contributes a rule
/// regardless of user-agent sections. A rule may be a path or a full
/// `gemini://` URL; either way the stored entry is a fully-qualified URL
/// prefix on this host.
pub fn parse_robots_txt(content: &str, host_key: &str) -> Vec<String> {
    let mut disallowed = Vec::new();

    for line in content.lines() {
        let line = line.trim().to_lowercase();
        let Some(value) = line.strip_prefix("disallow:") else {
            continue;
        };
        let path = value.trim();
        if path.is_empty() {
            continue;
        }

        let full_url = if let Some(stripped) = path.strip_prefix("gemini://") {
            // Re-anchor the path part of the URL onto this host.
            match stripped.split_once('/') {
                Some((_, path_part)) => format!("gemini://{host_key}/{path_part}"),
                None => format!("gemini://{host_key}/"),
            }
        } else if path.starts_with('/') {
            format!("gemini://{host_key}{path}")
        } else {
            format!("gemini://{host_key}/{path}")
        };

        disallowed.push(full_url);
    }

    disallowed
}

/// A URL is blocked iff some cached entry is a case-insensitive prefix of
/// its canonical form.
fn is_url_blocked(disallowed: &[String], url: &str) -> bool {
    let url_lower = url.to_lowercase();
    disallowed
        .iter()
        .any(|entry| url_lower.starts_with(&entry.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_disallow_paths() {
        let rules = parse_robots_txt(
            "User-agent: *\nDisallow: /private\nDisallow: /tmp/\nAllow: /ok\n",
            "example.com:1965",
        );
        assert_eq!(
            rules,
            vec![
                "gemini://example.com:1965/private".to_string(),
                "gemini://example.com:1965/tmp/".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_full_url_rule() {
        let rules = parse_robots_txt(
            "Disallow: gemini://example.com/secret\n",
            "example.com:1965",
        );
        assert_eq!(rules, vec!["gemini://example.com:1965/secret".to_string()]);
    }

    #[test]
    fn test_parse_relative_path_gets_slash() {
        let rules = parse_robots_txt("Disallow: cgi-bin\n", "example.com:1965");
        assert_eq!(rules, vec!["gemini://example.com:1965/cgi-bin".to_string()]);
    }

    #[test]
    fn test_parse_ignores_empty_disallow_and_other_lines() {
        let rules = parse_robots_txt(
            "# comment\nUser-agent: archiver\nDisallow:\nCrawl-delay: 10\n",
            "example.com:1965",
        );
        assert!(rules.is_empty());
    }

    #[test]
    fn test_prefix_match_is_case_insensitive() {
        let rules = vec!["gemini://example.com:1965/private".to_string()];
        assert!(is_url_blocked(&rules, "gemini://example.com:1965/PRIVATE/page"));
        assert!(is_url_blocked(&rules, "gemini://example.com:1965/private"));
        assert!(!is_url_blocked(&rules, "gemini://example.com:1965/public"));
    }

    #[tokio::test]
    async fn test_cached_entries_block_without_refetch() {
        let cache = RobotsCache::new();
        cache.insert_for_test(
            "example.com:1965",
            vec!["gemini://example.com:1965/private".to_string()],
        );

        let ctx = RequestContext::new("gemini://example.com/private/x", "example.com", 0);
        let config = Config::default();
        let url = GemUrl::parse("gemini://example.com/private/x", "", true).unwrap();
        assert!(cache.matches(&ctx, &url, &config).await.unwrap());

        let allowed = GemUrl::parse("gemini://example.com/blog", "", true).unwrap();
        assert!(!cache.matches(&ctx, &allowed, &config).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_cached_entry_blocks_nothing() {
        let cache = RobotsCache::new();
        cache.insert_for_test("example.com:1965", Vec::new());
        assert!(cache.contains_key("example.com:1965"));

        let ctx = RequestContext::new("gemini://example.com/x", "example.com", 0);
        let config = Config::default();
        let url = GemUrl::parse("gemini://example.com/x", "", true).unwrap();
        assert!(!cache.matches(&ctx, &url, &config).await.unwrap());
    }
}
