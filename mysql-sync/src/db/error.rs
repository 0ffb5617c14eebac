use thiserror::Error;

use crate::queue;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not connect to database")]
    NotConnected,

    #[error("database query failed: {0}")]
    Query(String),

    #[error("table \"{0}\" has no known primary key column")]
    MissingPrimaryKey(String),

    #[error("Sent id does not match entity id!")]
    IdMismatch,

    #[error("{0}")]
    Queue(#[from] queue::Error),

    #[error("{0}")]
    Hub(#[from] crate::hub::Error),
}
