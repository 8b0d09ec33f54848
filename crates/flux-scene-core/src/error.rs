use thiserror::Error;

/// 融合引擎统一错误类型
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("Unknown sender: {0}")]
    UnknownSender(String),

    #[error("Stale timestamp: lag {lag:.3}s exceeds {max_lag:.3}s")]
    StaleTimestamp { lag: f64, max_lag: f64 },

    #[error("Tracker backend error: {0}")]
    TrackerBackend(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("ReID circuit breaker open")]
    CircuitBreakerOpen,

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, FusionError>;

impl FusionError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaInvalid(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::Geometry(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    /// 只需记录并丢弃消息的错误
    pub fn is_message_scoped(&self) -> bool {
        matches!(
            self,
            Self::SchemaInvalid(_) | Self::UnknownSender(_) | Self::StaleTimestamp { .. }
        )
    }
}

impl From<anyhow::Error> for FusionError {
    fn from(err: anyhow::Error) -> Self {
        FusionError::Internal(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FusionError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FusionError::Bus(err.to_string())
    }
}
