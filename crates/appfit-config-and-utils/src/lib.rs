//! Configuration, paths, and logging setup shared by the AppFit outbox crates.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    OutboxConfig, DEFAULT_API_BASE_URL, DEFAULT_CHECKPOINT_INTERVAL_SECS, DEFAULT_LOG_LEVEL,
    DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_SEND_TIMEOUT_SECS,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
