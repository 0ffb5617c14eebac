use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on queue file \"{0}\": {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to (de)serialize queue contents in \"{0}\": {1}")]
    Serde(PathBuf, #[source] serde_json::Error),
}
