use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load transformer plug-in for \"{0}\": {1}")]
    Load(String, #[source] libloading::Error),

    #[error("transformer for \"{0}\" returned malformed JSON: {1}")]
    Decode(String, #[source] serde_json::Error),

    #[error("{0}")]
    Hub(#[from] crate::hub::Error),
}
