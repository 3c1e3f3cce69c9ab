pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod gemini;
pub mod gopher;
pub mod host_pool;
pub mod lists;
pub mod logging;
pub mod robots;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod text;
pub mod url;
pub mod worker;

// Re-export main types for library usage
pub use config::Config;
pub use context::RequestContext;
pub use engine::{Engine, Job};
pub use error::{CrawlError, Result};
pub use host_pool::HostPool;
pub use lists::{PatternList, SeedList};
pub use robots::RobotsCache;
pub use snapshot::{LinkList, Snapshot};
pub use store::Store;
pub use crate::url::GemUrl;
