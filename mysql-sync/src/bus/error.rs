use thiserror::Error;

use crate::queue;

#[derive(Debug, Error)]
pub enum Error {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("failed to (de)serialize bus payload: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Queue(#[from] queue::Error),

    #[error("{0}")]
    Hub(#[from] crate::hub::Error),
}
