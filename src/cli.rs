use clap::Parser;

/// gemcrawl: a persistent crawler and archiver for Gemini and Gopher space.
#[derive(Parser, Debug)]
#[command(name = "gemcrawl")]
#[command(about = "A polite crawler and archiver for the Gemini and Gopher protocols")]
#[command(version)]
pub struct Cli {
    /// Logging level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Postgres URL
    #[arg(long)]
    pub pgurl: String,

    /// Dry run mode: crawl but skip snapshot writes
    #[arg(long)]
    pub dry_run: bool,

    /// Enable crawling of Gopher holes
    #[arg(long)]
    pub gopher: bool,

    /// Maximum number of database connections
    #[arg(long, default_value = "100")]
    pub max_db_connections: u32,

    /// Number of concurrent workers
    #[arg(long, default_value = "1")]
    pub workers: usize,

    /// Maximum size of a response in bytes
    #[arg(long, default_value = "1048576")]
    pub max_response_size: usize,

    /// Timeout for network responses in seconds
    #[arg(long, default_value = "10")]
    pub response_timeout: u64,

    /// File with blacklist regexes, one per line
    #[arg(long)]
    pub blacklist_path: Option<String>,

    /// File with URLs that should always be crawled regardless of blacklist
    #[arg(long)]
    pub whitelist_path: Option<String>,

    /// File with seed URLs to add to the queue on startup
    #[arg(long)]
    pub seed_url_path: Option<String>,

    /// Skip re-crawling URLs updated within this many days (0 to disable)
    #[arg(long, default_value = "60")]
    pub skip_if_updated_days: i64,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
