use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("fallback request failed: {0}")]
    Fallback(String),

    #[error("local store: {0}")]
    Store(#[source] anyhow::Error),

    #[error("client task is not running")]
    TaskGone,
}
