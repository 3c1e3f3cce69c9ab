//! URL model and normalizer for Gemini and Gopher URLs.

use std::fmt;
use std::sync::OnceLock;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::error::{CrawlError, Result};

/// Characters percent-escaped inside a path segment.
const SEGMENT_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'\\')
    .add(b'^')
    .add(b'|');

pub fn is_gemini_url(s: &str) -> bool {
    s.starts_with("gemini://")
}

pub fn is_gopher_url(s: &str) -> bool {
    s.starts_with("gopher://")
}

/// A parsed, normalized crawl URL.
///
/// `full` is the canonical form and always carries an explicit port, even
/// the default one; it round-trips through `parse`. The wire request form
/// (without a default port) comes from `string_no_default_port`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GemUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub descr: String,
    pub full: String,
}

impl fmt::Display for GemUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full)
    }
}

impl GemUrl {
    /// Parses `input` into a `GemUrl`, normalizing first when asked.
    ///
    /// Fails when the scheme or host is absent or the port is not numeric.
    pub fn parse(input: &str, descr: &str, normalize: bool) -> Result<GemUrl> {
        let parts = if normalize {
            NormalizedParts::from_raw(input)?
        } else {
            NormalizedParts::from_raw_verbatim(input)?
        };

        let port = parts
            .explicit_port
            .unwrap_or_else(|| default_port(&parts.scheme));

        let mut full = format!(
            "{}://{}:{}{}",
            parts.scheme, parts.host, port, parts.path
        );
        if let Some(query) = &parts.query {
            full.push('?');
            full.push_str(query);
        }
        if let Some(fragment) = &parts.fragment {
            full.push('#');
            full.push_str(fragment);
        }

        Ok(GemUrl {
            scheme: parts.scheme,
            host: parts.host,
            port,
            path: parts.path,
            descr: descr.to_string(),
            full,
        })
    }

    /// The canonical form with the default port suppressed. This is the
    /// form sent on the wire: some servers reject proxied-looking requests
    /// when the default port appears explicitly.
    pub fn string_no_default_port(&self) -> String {
        if self.port != default_port(&self.scheme) {
            return self.full.clone();
        }
        let prefix = format!("{}://{}:{}", self.scheme, self.host, self.port);
        format!(
            "{}://{}{}",
            self.scheme,
            self.host,
            &self.full[prefix.len()..]
        )
    }

    /// Lowercased `host:port` key used by the robots cache.
    pub fn host_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "gemini" {
        Config::GEMINI_DEFAULT_PORT
    } else {
        Config::GOPHER_DEFAULT_PORT
    }
}

struct NormalizedParts {
    scheme: String,
    host: String,
    explicit_port: Option<u16>,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl NormalizedParts {
    /// Full normalization: lowercase scheme and host, clean and escape the
    /// path, preserve query and fragment verbatim.
    fn from_raw(raw: &str) -> Result<Self> {
        let u = Url::parse(raw)
            .map_err(|e| CrawlError::Url(format!("error normalizing URL: {e}: {raw}")))?;

        let host = match u.host_str() {
            Some(h) if !h.is_empty() => h.to_ascii_lowercase(),
            _ => {
                return Err(CrawlError::Url(format!(
                    "error normalizing URL: no host: {raw}"
                )))
            }
        };
        let scheme = u.scheme().to_ascii_lowercase();

        let raw_path = u.path();
        let path = if raw_path.is_empty() {
            // Authority-only form.
            "/".to_string()
        } else {
            let had_trailing_slash = raw_path.ends_with('/');
            let mut cleaned = clean_path(raw_path);
            if had_trailing_slash && cleaned != "/" {
                cleaned.push('/');
            }
            escape_path(&cleaned)
        };

        Ok(Self {
            scheme,
            host,
            explicit_port: u.port(),
            path,
            query: u.query().map(str::to_string),
            fragment: u.fragment().map(str::to_string),
        })
    }

    /// Verbatim parse used for values that are already canonical, e.g.
    /// rows coming back from the store.
    fn from_raw_verbatim(raw: &str) -> Result<Self> {
        let u = Url::parse(raw)
            .map_err(|e| CrawlError::Url(format!("error parsing URL: {e}: {raw}")))?;

        let host = match u.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => {
                return Err(CrawlError::Url(format!(
                    "error parsing URL: no host: {raw}"
                )))
            }
        };

        Ok(Self {
            scheme: u.scheme().to_string(),
            host,
            explicit_port: u.port(),
            path: u.path().to_string(),
            query: u.query().map(str::to_string),
            fragment: u.fragment().map(str::to_string),
        })
    }
}

/// Resolves `.` and `..` segments and collapses runs of `/`. The result is
/// absolute and has no trailing slash unless it is the root.
fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Percent-escapes each path segment unless it is already escaped.
fn escape_path(path: &str) -> String {
    path.split('/')
        .map(escape_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn escape_segment(segment: &str) -> String {
    // An already-escaped segment decodes to something different; leave it.
    if let Ok(decoded) = percent_decode_str(segment).decode_utf8() {
        if decoded != segment {
            return segment.to_string();
        }
    }
    utf8_percent_encode(segment, SEGMENT_ESCAPE).to_string()
}

/// Converts a possibly-relative URL to an absolute one against `base`.
/// Used primarily to compute the target of a redirect response.
pub fn derive_absolute(base: &GemUrl, input: &str) -> Result<GemUrl> {
    if input.contains("://") {
        return GemUrl::parse(input, "", true);
    }

    let new_path = if input.starts_with('/') {
        clean_path(input)
    } else if input == "." || input == "./" {
        "/".to_string()
    } else {
        clean_path(&format!("{}/{}", base.path, input))
    };

    let absolute = format!("{}://{}:{}{}", base.scheme, base.host, base.port, new_path);
    GemUrl::parse(&absolute, "", true)
}

/// Parses the redirection target out of a Gemini status line and resolves
/// it against the URL being visited.
pub fn extract_redirect_target(base: &GemUrl, header: &str) -> Result<GemUrl> {
    static TARGET: OnceLock<Regex> = OnceLock::new();
    let re = TARGET.get_or_init(|| Regex::new(r"\d+\s+([^\r]+)").unwrap());

    let captures = re.captures(header).ok_or_else(|| {
        CrawlError::Url(format!("error extracting redirect target from: {header}"))
    })?;
    derive_absolute(base, &captures[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case_and_path() {
        let u = GemUrl::parse("gemini://Example.COM:1965//a/./b/", "", true).unwrap();
        assert_eq!(u.scheme, "gemini");
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, 1965);
        assert_eq!(u.path, "/a/b/");
        assert_eq!(u.full, "gemini://example.com:1965/a/b/");
        assert_eq!(u.string_no_default_port(), "gemini://example.com/a/b/");
    }

    #[test]
    fn test_canonical_round_trip() {
        for input in [
            "gemini://Example.COM:1965//a/./b/",
            "gemini://smol.gr/a/b?x=1#frag",
            "gopher://example.com/1/about",
            "gemini://host.gr:7000/café/page",
        ] {
            let first = GemUrl::parse(input, "", true).unwrap();
            let second = GemUrl::parse(&first.full, "", true).unwrap();
            assert_eq!(first.full, second.full, "round trip failed for {input}");
        }
    }

    #[test]
    fn test_authority_only_becomes_root() {
        let u = GemUrl::parse("gemini://example.com", "", true).unwrap();
        assert_eq!(u.path, "/");
        assert_eq!(u.full, "gemini://example.com:1965/");
    }

    #[test]
    fn test_gopher_default_port() {
        let u = GemUrl::parse("gopher://example.com/1/about", "", true).unwrap();
        assert_eq!(u.port, 70);
        assert_eq!(u.full, "gopher://example.com:70/1/about");
        assert_eq!(u.string_no_default_port(), "gopher://example.com/1/about");
    }

    #[test]
    fn test_non_default_port_kept_on_wire_form() {
        let u = GemUrl::parse("gemini://example.com:7000/x", "", true).unwrap();
        assert_eq!(u.string_no_default_port(), "gemini://example.com:7000/x");
    }

    #[test]
    fn test_query_and_fragment_preserved() {
        let u = GemUrl::parse("gemini://gemi.dev/x?1=2#sec", "", true).unwrap();
        assert_eq!(u.full, "gemini://gemi.dev:1965/x?1=2#sec");
        assert_eq!(u.string_no_default_port(), "gemini://gemi.dev/x?1=2#sec");
    }

    #[test]
    fn test_parse_failures() {
        assert!(GemUrl::parse("no-scheme-here", "", true).is_err());
        assert!(GemUrl::parse("gemini://", "", true).is_err());
        assert!(GemUrl::parse("gemini://host:notaport/", "", true).is_err());
    }

    #[test]
    fn test_segment_escaping_is_idempotent() {
        let once = GemUrl::parse("gemini://example.com/a b/c", "", true).unwrap();
        assert_eq!(once.path, "/a%20b/c");
        let twice = GemUrl::parse(&once.full, "", true).unwrap();
        assert_eq!(twice.path, "/a%20b/c");
        assert_eq!(once.full, twice.full);
    }

    #[test]
    fn test_trailing_slash_preserved() {
        let with = GemUrl::parse("gemini://example.com/dir/", "", true).unwrap();
        assert_eq!(with.path, "/dir/");
        let without = GemUrl::parse("gemini://example.com/dir", "", true).unwrap();
        assert_eq!(without.path, "/dir");
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("//a/./b/"), "/a/b");
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/.."), "/");
        assert_eq!(clean_path("/"), "/");
    }

    #[test]
    fn test_derive_absolute_dot() {
        let base = GemUrl::parse("gemini://smol.gr:1965/a/b", "", true).unwrap();
        let resolved = derive_absolute(&base, "./").unwrap();
        assert_eq!(resolved.full, "gemini://smol.gr:1965/");
    }

    #[test]
    fn test_derive_absolute_rooted() {
        let base = GemUrl::parse("gemini://smol.gr/a/b", "", true).unwrap();
        let resolved = derive_absolute(&base, "/x/y").unwrap();
        assert_eq!(resolved.full, "gemini://smol.gr:1965/x/y");
    }

    #[test]
    fn test_derive_absolute_relative() {
        let base = GemUrl::parse("gemini://smol.gr/a/b", "", true).unwrap();
        let resolved = derive_absolute(&base, "c/d").unwrap();
        assert_eq!(resolved.full, "gemini://smol.gr:1965/a/b/c/d");
    }

    #[test]
    fn test_derive_absolute_full_url() {
        let base = GemUrl::parse("gemini://smol.gr/a", "", true).unwrap();
        let resolved = derive_absolute(&base, "gemini://other.gr/z").unwrap();
        assert_eq!(resolved.full, "gemini://other.gr:1965/z");
    }

    #[test]
    fn test_extract_redirect_target() {
        let base = GemUrl::parse("gemini://source.gr/page", "", true).unwrap();
        let target = extract_redirect_target(&base, "31 gemini://target.gr/").unwrap();
        assert_eq!(target.full, "gemini://target.gr:1965/");
    }

    #[test]
    fn test_redirect_matches_derive_absolute() {
        let base = GemUrl::parse("gemini://source.gr/a/b", "", true).unwrap();
        for target in ["/new", "sub/page", "gemini://other.gr/x", "./"] {
            let via_header =
                extract_redirect_target(&base, &format!("31 {target}")).unwrap();
            let direct = derive_absolute(&base, target).unwrap();
            assert_eq!(via_header.full, direct.full);
        }
    }

    #[test]
    fn test_extract_redirect_target_bad_header() {
        let base = GemUrl::parse("gemini://source.gr/", "", true).unwrap();
        assert!(extract_redirect_target(&base, "garbage").is_err());
    }

    #[test]
    fn test_normalization_idempotence() {
        for input in [
            "gemini://Example.COM:1965//a/./b/",
            "gemini://h.gr/a b/c",
            "gopher://H.GR/1//x/../y",
        ] {
            let once = GemUrl::parse(input, "", true).unwrap();
            let twice = GemUrl::parse(&once.full, "", true).unwrap();
            assert_eq!(once.full, twice.full);
        }
    }

    #[test]
    fn test_scheme_predicates() {
        assert!(is_gemini_url("gemini://a.gr/"));
        assert!(!is_gemini_url("gopher://a.gr/"));
        assert!(is_gopher_url("gopher://a.gr/"));
        assert!(!is_gopher_url("https://a.gr/"));
    }

    #[test]
    fn test_host_key() {
        let u = GemUrl::parse("gemini://Example.COM/x", "", true).unwrap();
        assert_eq!(u.host_key(), "example.com:1965");
    }
}
