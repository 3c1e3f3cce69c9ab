//! Gemini protocol client: TLS dial, request, response parsing and
//! gemtext link extraction.
//!
//! References: gemini://geminiprotocol.net/docs/protocol-specification.gmi

use std::sync::OnceLock;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{gemini_error, CrawlError, Result};
use crate::snapshot::{LinkList, Snapshot};
use crate::text;
use crate::url::GemUrl;

/// Visits a Gemini URL and returns a populated snapshot.
///
/// Host and protocol errors are recorded inside the snapshot rather than
/// returned; an error comes back only when no snapshot could be produced
/// at all (context cancellation, unparseable URL).
pub async fn visit(ctx: &RequestContext, url: &str, config: &Config) -> Result<Snapshot> {
    let ctx = ctx.with_component("gemini");
    let mut snapshot = Snapshot::from_url(url, true)?;

    ctx.checkpoint()?;
    tracing::debug!(url = %snapshot.url, "visiting gemini URL");

    let data = match connect_and_get_data(&ctx, &snapshot.url, config).await {
        Ok(data) => data,
        Err(err @ CrawlError::Host(_)) => {
            tracing::info!(url = %snapshot.url, error = %err, "host error");
            snapshot.error = Some(err.to_string());
            return Ok(snapshot);
        }
        Err(err) => return Err(err),
    };

    ctx.checkpoint()?;
    apply_response(&mut snapshot, &data, config.max_response_size);

    if snapshot.is_gemini_capsule() {
        let gemtext = snapshot.gemtext.clone().unwrap_or_default();
        let links = extract_links(&snapshot.url, &gemtext);
        if !links.is_empty() {
            snapshot.links = Some(links);
        }
    }

    tracing::debug!(
        url = %snapshot.url,
        code = snapshot.response_code.unwrap_or_default(),
        "gemini visit finished"
    );
    Ok(snapshot)
}

/// Performs the wire exchange and returns the raw response bytes.
///
/// The request is the canonical URL with any default `:1965` stripped:
/// some servers answer `53 No proxying to other hosts or ports!` when the
/// default port is spelled out.
pub async fn connect_and_get_data(
    ctx: &RequestContext,
    url: &GemUrl,
    config: &Config,
) -> Result<Vec<u8>> {
    let addr = format!("{}:{}", url.host, url.port);
    let timeout = config.response_timeout();

    ctx.checkpoint()?;
    tracing::debug!(%addr, "dialing");
    let tcp = ctx.io(timeout, TcpStream::connect(&addr)).await?;

    let connector = tls_connector()?;
    let mut stream = ctx.io(timeout, connector.connect(&url.host, tcp)).await?;

    let request = format!("{}\r\n", url.string_no_default_port());
    ctx.io(timeout, stream.write_all(request.as_bytes())).await?;

    let mut data: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; Config::READ_CHUNK_SIZE];
    loop {
        ctx.checkpoint()?;
        let n = ctx.io(timeout, stream.read(&mut buf)).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > config.max_response_size {
            return Err(CrawlError::Host(format!(
                "response too large (max {} bytes)",
                config.max_response_size
            )));
        }
    }

    tracing::debug!(bytes = data.len(), "response received");
    Ok(data)
}

/// TLS with certificate verification disabled: Gemini servers commonly use
/// self-signed certificates, and trust-on-first-use is handled elsewhere.
fn tls_connector() -> Result<tokio_native_tls::TlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| CrawlError::Host(format!("TLS setup failed: {e}")))?;
    Ok(tokio_native_tls::TlsConnector::from(connector))
}

/// Splits the raw response into status line and body and fills in the
/// snapshot. A body is stored only for successful responses; any protocol
/// error lands in `snapshot.error` with code and header kept alongside.
pub fn apply_response(snapshot: &mut Snapshot, data: &[u8], max_response_size: usize) {
    let Some(newline) = data.iter().position(|b| *b == b'\n') else {
        snapshot.error = Some("error parsing response header".to_string());
        return;
    };
    let header = String::from_utf8_lossy(&data[..newline]).trim().to_string();
    let body = &data[newline + 1..];

    let Some((code, mime_type, lang)) = parse_header(&header) else {
        snapshot.error = Some(format!("error parsing response header: {header}"));
        return;
    };

    snapshot.response_code = Some(code);
    snapshot.header = Some(header.clone());

    if code != 20 {
        snapshot.error = Some(gemini_error(code, &header).to_string());
        return;
    }

    if !mime_type.is_empty() {
        snapshot.mime_type = Some(mime_type.clone());
    }
    if !lang.is_empty() {
        snapshot.lang = Some(lang);
    }

    if mime_type == "text/gemini" {
        match text::bytes_to_valid_utf8(body, max_response_size) {
            Ok(gemtext) => snapshot.gemtext = Some(gemtext),
            Err(err) => snapshot.error = Some(err.to_string()),
        }
    } else {
        snapshot.data = Some(body.to_vec());
    }
}

/// Parses a Gemini status line. Three shapes are recognized, in order:
/// `<code> <mimetype>[; charset=..][; lang=..]`, `<code> <free-form>`
/// (covers redirect targets), and a bare `<code>`.
pub fn parse_header(header: &str) -> Option<(i32, String, String)> {
    static FULL: OnceLock<Regex> = OnceLock::new();
    static FREE_FORM: OnceLock<Regex> = OnceLock::new();
    static CODE_ONLY: OnceLock<Regex> = OnceLock::new();

    let full = FULL.get_or_init(|| {
        Regex::new(
            r"^(\d+)\s+([a-zA-Z0-9/\-+]+)(?:(?:[\s;]+(?:charset=[^;\s]+|lang=([a-zA-Z0-9-]+)))*)\s*$",
        )
        .unwrap()
    });
    let free_form = FREE_FORM.get_or_init(|| Regex::new(r"^(\d+)\s+(.+)$").unwrap());
    let code_only = CODE_ONLY.get_or_init(|| Regex::new(r"^(\d+)\s*$").unwrap());

    if let Some(caps) = full.captures(header) {
        let code = caps[1].parse().ok()?;
        let mime_type = caps[2].to_string();
        let lang = caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default();
        return Some((code, mime_type, lang));
    }
    if let Some(caps) = free_form.captures(header) {
        let code = caps[1].parse().ok()?;
        return Some((code, String::new(), String::new()));
    }
    if let Some(caps) = code_only.captures(header) {
        let code = caps[1].parse().ok()?;
        return Some((code, String::new(), String::new()));
    }
    None
}

/// Extracts the links of a gemtext document in order.
pub fn extract_links(base: &GemUrl, gemtext: &str) -> LinkList {
    static LINK_LINE: OnceLock<Regex> = OnceLock::new();
    let re = LINK_LINE.get_or_init(|| Regex::new(r"(?m)^=>[ \t]+.*").unwrap());

    let mut links = LinkList::new();
    for line in text::lines_matching_regex(gemtext, re) {
        match parse_link_line(base, line) {
            Ok(link) => links.push(link),
            Err(err) => {
                tracing::debug!(line, error = %err, "skipping unparseable link line");
            }
        }
    }
    links
}

/// Parses one `=>` link line, resolving a relative target against the URL
/// the document was fetched from.
pub fn parse_link_line(base: &GemUrl, line: &str) -> Result<GemUrl> {
    static LINK_PARTS: OnceLock<Regex> = OnceLock::new();
    let re = LINK_PARTS.get_or_init(|| Regex::new(r"^=>[ \t]+(\S+)([ \t]+.*)?").unwrap());

    let caps = re
        .captures(line)
        .ok_or_else(|| CrawlError::Url(format!("not a link line: {line}")))?;
    let target = &caps[1];
    let mut descr = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    // Drop the single separating space between URL and description.
    if let Some(stripped) = descr.strip_prefix(' ') {
        descr = stripped;
    }

    let base_url = url::Url::parse(&base.full)
        .map_err(|e| CrawlError::Url(format!("invalid base URL {}: {e}", base.full)))?;
    let resolved = match url::Url::parse(target) {
        Ok(absolute) => absolute,
        Err(url::ParseError::RelativeUrlWithoutBase) => base_url
            .join(target)
            .map_err(|e| CrawlError::Url(format!("cannot resolve link {target}: {e}")))?,
        Err(e) => return Err(CrawlError::Url(format!("cannot parse link {target}: {e}"))),
    };

    GemUrl::parse(resolved.as_str(), descr, true)
}
