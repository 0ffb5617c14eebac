use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error reading \"{0}\": {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("JSON parse error in \"{0}\": {1}")]
    Parse(PathBuf, #[source] serde_json::Error),

    #[error("clientName must be 2-32 characters of [A-Za-z0-9_-], got \"{0}\"")]
    InvalidClientName(String),

    #[error("checkInterval must be >= 1ms, got {0}")]
    InvalidCheckInterval(u64),
}
