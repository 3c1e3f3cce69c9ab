//! Blacklist, whitelist and seed list loaders.
//!
//! Blacklist and whitelist files are line-delimited regexes; the seed file
//! is one URL per line. `#`-prefixed lines and blank lines are ignored in
//! all three. A regex that fails to compile aborts startup.

use regex::Regex;

use crate::error::{CrawlError, Result};

/// A compiled list of regex patterns.
#[derive(Debug, Default)]
pub struct PatternList {
    patterns: Vec<Regex>,
}

impl PatternList {
    /// Loads patterns from the file at `path`; an absent path yields an
    /// empty list that matches nothing.
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let data = std::fs::read_to_string(p).map_err(|e| {
                    CrawlError::Fatal(format!("could not load pattern file {p}: {e}"))
                })?;
                Self::from_content(&data)
            }
        }
    }

    pub fn from_content(content: &str) -> Result<Self> {
        let mut patterns = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let regex = Regex::new(line).map_err(|e| {
                CrawlError::Fatal(format!("could not compile pattern line {line}: {e}"))
            })?;
            patterns.push(regex);
        }
        Ok(Self { patterns })
    }

    pub fn matches(&self, input: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(input))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Seed URLs enqueued when the crawl queue starts out empty.
#[derive(Debug, Default)]
pub struct SeedList {
    urls: Vec<String>,
}

impl SeedList {
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let data = std::fs::read_to_string(p).map_err(|e| {
                    CrawlError::Fatal(format!("could not load seed file {p}: {e}"))
                })?;
                Ok(Self::from_content(&data))
            }
        }
    }

    pub fn from_content(content: &str) -> Self {
        let urls = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self { urls }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}
