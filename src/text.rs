//! Text and encoding helpers.

use encoding_rs::Encoding;
use regex::Regex;

use crate::error::{CrawlError, Result};

/// Fallback decoders tried in order when a body is not valid UTF-8.
/// The first decoder that converts without errors wins.
static FALLBACK_ENCODINGS: &[&Encoding] = &[
    encoding_rs::WINDOWS_1252, // also covers ISO-8859-1
    encoding_rs::ISO_8859_7,
    encoding_rs::WINDOWS_1250, // Central European
    encoding_rs::WINDOWS_1251, // Cyrillic
    encoding_rs::WINDOWS_1256, // Arabic
    encoding_rs::EUC_JP,
    encoding_rs::EUC_KR,
];

/// Removes all NUL characters from the input.
pub fn strip_null_chars(input: &str) -> String {
    input.replace('\u{0000}', "")
}

/// Coerces raw bytes into valid UTF-8.
///
/// NUL bytes are stripped first. If the remainder is valid UTF-8 it is
/// returned as-is; otherwise the fallback decoders run in order and the
/// first clean conversion wins. Inputs over `max_size` fail immediately.
pub fn bytes_to_valid_utf8(input: &[u8], max_size: usize) -> Result<String> {
    if input.is_empty() {
        return Ok(String::new());
    }

    let max_size = if max_size == 0 { 1024 * 1024 } else { max_size };
    if input.len() > max_size {
        return Err(CrawlError::Host(format!(
            "input too large: {} bytes (max {})",
            input.len(),
            max_size
        )));
    }

    let without_nulls: Vec<u8> = input.iter().copied().filter(|b| *b != 0).collect();
    if let Ok(valid) = std::str::from_utf8(&without_nulls) {
        return Ok(valid.to_string());
    }

    for encoding in FALLBACK_ENCODINGS {
        let (decoded, _, had_errors) = encoding.decode(&without_nulls);
        if !had_errors {
            return Ok(decoded.into_owned());
        }
    }

    Err(CrawlError::Host(format!(
        "UTF-8 conversion failed after trying {} encodings",
        FALLBACK_ENCODINGS.len()
    )))
}

/// Returns all substrings of `input` matching `pattern`.
pub fn lines_matching_regex<'a>(input: &'a str, pattern: &Regex) -> Vec<&'a str> {
    pattern.find_iter(input).map(|m| m.as_str()).collect()
}
