use haul_core::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            CacheError::Connection(e.to_string())
        } else {
            CacheError::Command(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Codec(e.to_string())
    }
}

impl From<CacheError> for RelayError {
    fn from(e: CacheError) -> Self {
        RelayError::Store(e.to_string())
    }
}
