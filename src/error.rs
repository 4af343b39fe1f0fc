use thiserror::Error;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::engine::EngineError;

/// Handler-level failure reported to the exchange caller.
///
/// Every error raised while dispatching a message ends up here, carrying the
/// underlying cause. One-way operations that fail never produce a reply.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Unknown entry point: {entry_point}; please check your rules source")]
    UnknownEntryPoint { entry_point: String },

    #[error("Unsupported rules action type: {action}")]
    UnsupportedAction { action: String },

    #[error("Rules handler is not initialized")]
    NotInitialized,

    /// The reply could not be delivered. Evaluation has already run.
    #[error("Reply failed for exchange {exchange_id}: {message}")]
    ReplyFailed {
        exchange_id: String,
        message: String,
    },

    #[error("Message conversion failed: {0}")]
    MessageConversion(String),

    #[error("Audit logger failed: {0}")]
    Audit(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

pub type HandlerResult<T> = Result<T, HandlerError>;

impl HandlerError {
    pub fn audit<S: Into<String>>(message: S) -> Self {
        HandlerError::Audit(message.into())
    }
}
