use crate::cli::Cli;

/// Runtime configuration assembled from the CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    pub pgurl: String,
    pub log_level: String,
    pub dry_run: bool,
    pub gopher_enabled: bool,
    pub max_db_connections: u32,
    pub workers: usize,
    pub max_response_size: usize,
    pub response_timeout_secs: u64,
    pub blacklist_path: Option<String>,
    pub whitelist_path: Option<String>,
    pub seed_url_path: Option<String>,
    pub skip_if_updated_days: i64,
}

impl Config {
    /// Hard deadline for one URL's whole pipeline run.
    pub const REQUEST_TIMEOUT_SECS: u64 = 120;

    /// Chunk size for protocol reads.
    pub const READ_CHUNK_SIZE: usize = 4096;

    /// Poll interval while waiting for a host pool slot.
    pub const HOST_POOL_POLL_MS: u64 = 500;

    /// Upper bound of the random delay added when a host slot is released.
    pub const HOST_POOL_RELEASE_JITTER_MS: u64 = 1000;

    /// How many pending URLs the scheduler grabs per host and batch.
    pub const URLS_PER_HOST: i64 = 10;

    /// Scheduler sleep when the queue is empty and backfill found nothing.
    pub const IDLE_SLEEP_SECS: u64 = 120;

    /// History backfill inserts up to this many URLs per worker.
    pub const BACKFILL_URLS_PER_WORKER: usize = 10;

    pub const GEMINI_DEFAULT_PORT: u16 = 1965;
    pub const GOPHER_DEFAULT_PORT: u16 = 70;

    pub fn from_cli(cli: Cli) -> Self {
        Self {
            pgurl: cli.pgurl,
            log_level: cli.log_level,
            dry_run: cli.dry_run,
            gopher_enabled: cli.gopher,
            max_db_connections: cli.max_db_connections,
            workers: cli.workers.max(1),
            max_response_size: cli.max_response_size,
            response_timeout_secs: cli.response_timeout,
            blacklist_path: cli.blacklist_path,
            whitelist_path: cli.whitelist_path,
            seed_url_path: cli.seed_url_path,
            skip_if_updated_days: cli.skip_if_updated_days,
        }
    }

    pub fn response_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.response_timeout_secs)
    }
}

#[cfg(test)]
impl Default for Config {
    /// Test configuration that never touches a real database.
    fn default() -> Self {
        Self {
            pgurl: String::new(),
            log_level: "info".to_string(),
            dry_run: true,
            gopher_enabled: true,
            max_db_connections: 2,
            workers: 1,
            max_response_size: 1024 * 1024,
            response_timeout_secs: 10,
            blacklist_path: None,
            whitelist_path: None,
            seed_url_path: None,
            skip_if_updated_days: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_from_cli() {
        let cli = crate::cli::Cli::parse_from([
            "gemcrawl",
            "--pgurl",
            "postgres://localhost/gemcrawl",
            "--workers",
            "4",
            "--response-timeout",
            "30",
        ]);
        let config = Config::from_cli(cli);
        assert_eq!(config.workers, 4);
        assert_eq!(config.response_timeout(), std::time::Duration::from_secs(30));
        assert!(!config.gopher_enabled);
    }

    #[test]
    fn test_workers_floor() {
        let cli = crate::cli::Cli::parse_from([
            "gemcrawl",
            "--pgurl",
            "postgres://localhost/gemcrawl",
            "--workers",
            "0",
        ]);
        let config = Config::from_cli(cli);
        assert_eq!(config.workers, 1);
    }
}
