//! End-to-end checks on the library surface that need no network or
//! database: URL laws, link extraction, menu parsing, robots rules and
//! host pool exclusivity.

use std::sync::Arc;
use std::time::Duration;

use gemcrawl::url::{derive_absolute, extract_redirect_target};
use gemcrawl::{gemini, gopher, GemUrl, HostPool, RequestContext};

#[test]
fn normalization_is_idempotent_across_inputs() {
    let inputs = [
        "gemini://Example.COM:1965//a/./b/",
        "gemini://smol.gr/a/b?x=1#frag",
        "gemini://host.gr/with space/seg",
        "gopher://Example.ORG/1/deep//path/../x",
        "gemini://example.com",
    ];
    for input in inputs {
        let once = GemUrl::parse(input, "", true).unwrap();
        let twice = GemUrl::parse(&once.full, "", true).unwrap();
        assert_eq!(once.full, twice.full, "not idempotent for {input}");
        assert_eq!(once.path, twice.path);
    }
}

#[test]
fn canonical_form_round_trips() {
    let u = GemUrl::parse("gemini://Example.COM:1965//a/./b/", "", true).unwrap();
    assert_eq!(u.full, "gemini://example.com:1965/a/b/");
    let reparsed = GemUrl::parse(&u.full, "", true).unwrap();
    assert_eq!(reparsed.full, u.full);
    assert_eq!(reparsed.port, 1965);
    assert_eq!(reparsed.scheme, "gemini");
}

#[test]
fn redirect_resolution_matches_derive_absolute() {
    let base = GemUrl::parse("gemini://smol.gr:1965/a/b", "", true).unwrap();
    for target in ["./", "/abs/path", "relative/page", "gemini://other.gr/x?q=1"] {
        let via_redirect =
            extract_redirect_target(&base, &format!("31 {target}")).unwrap();
        let direct = derive_absolute(&base, target).unwrap();
        assert_eq!(via_redirect.full, direct.full, "mismatch for {target}");
    }
}

#[test]
fn gemtext_extraction_end_to_end() {
    let base = GemUrl::parse("gemini://gemi.dev/cgi-bin/xkcd/", "", true).unwrap();
    let body = "# H\n=> archive/ Complete Archive\n=> /x?1=2 Q\n";
    let links = gemini::extract_links(&base, body);

    assert_eq!(links.len(), 2);
    assert_eq!(links[0].full, "gemini://gemi.dev:1965/cgi-bin/xkcd/archive/");
    assert_eq!(links[0].descr, "Complete Archive");
    assert_eq!(links[1].full, "gemini://gemi.dev:1965/x?1=2");
    assert_eq!(links[1].descr, "Q");
}

#[test]
fn gemini_full_response_to_snapshot() {
    let mut snapshot =
        gemcrawl::Snapshot::from_url("gemini://gemi.dev/cgi-bin/xkcd/", true).unwrap();
    let wire = b"20 text/gemini; lang=en-US; charset=utf-8\r\n# H\n=> archive/ Complete Archive\n";
    gemini::apply_response(&mut snapshot, wire, 1024 * 1024);

    assert_eq!(snapshot.response_code, Some(20));
    assert_eq!(snapshot.mime_type.as_deref(), Some("text/gemini"));
    assert_eq!(snapshot.lang.as_deref(), Some("en-US"));
    assert!(snapshot.is_gemini_capsule());

    let links = gemini::extract_links(&snapshot.url, snapshot.gemtext.as_deref().unwrap());
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].full, "gemini://gemi.dev:1965/cgi-bin/xkcd/archive/");
}

#[test]
fn gopher_menu_scenarios() {
    let menu = "1About\t/about\texample.com\t70\niwelcome\t\texample.com\t70\n";
    let links = gopher::extract_menu_links(menu);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].full, "gopher://example.com:70/1/about");

    assert!(gopher::check_for_error("3error\t\texample.com\t70\n").is_some());
    assert!(gopher::check_for_error(menu).is_none());
}

#[test]
fn robots_rules_block_by_prefix() {
    let rules = gemcrawl::robots::parse_robots_txt(
        "User-agent: *\nDisallow: /private\n",
        "example.com:1965",
    );
    assert_eq!(rules, vec!["gemini://example.com:1965/private".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_pool_never_admits_duplicates() {
    let pool = HostPool::new();
    let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let pool = Arc::clone(&pool);
        let in_flight = Arc::clone(&in_flight);
        let max_seen = Arc::clone(&max_seen);
        tasks.push(tokio::spawn(async move {
            let ctx = RequestContext::new("gemini://busy.gr/", "busy.gr", worker);
            let guard = pool.acquire(&ctx, "busy.gr").await.unwrap();

            let now = in_flight.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            in_flight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);

            drop(guard);
        }));
    }
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("host pool acquire stalled")
            .unwrap();
    }

    assert_eq!(max_seen.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn encoding_chain_handles_legacy_bodies() {
    // Windows-1251 Cyrillic bytes are not valid UTF-8.
    let bytes = [0xCF, 0xF0, 0xE8, 0xE2, 0xE5, 0xF2];
    let decoded = gemcrawl::text::bytes_to_valid_utf8(&bytes, 1024).unwrap();
    assert!(!decoded.is_empty());
}
