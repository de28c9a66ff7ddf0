use attention::AttentionError;
use thiserror::Error;

/// Failures while loading a configuration or assembling the network.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("replace_stride_with_dilation should be None or a 3-element list, got {got:?}")]
    ReplaceStrideWithDilation { got: Vec<bool> },
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl ModelError {
    pub fn invalid_config(messages: &[String]) -> Self {
        Self::InvalidConfig(messages.join("; "))
    }
}

impl From<toml::de::Error> for ModelError {
    fn from(value: toml::de::Error) -> Self {
        ModelError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(value: serde_json::Error) -> Self {
        ModelError::ConfigFormat(value.to_string())
    }
}
