use thiserror::Error;

/// Errors raised by the model factory, the heads and checkpoints.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown backbone `{name}`: {reason}")]
    UnknownBackbone { name: String, reason: String },

    #[error("deploy method `{deploy}` is not supported: {reason}")]
    UnsupportedDeploy { deploy: String, reason: String },

    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Meta(#[from] fsl_meta::Error),

    #[error(transparent)]
    Tensor(#[from] fsl_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Writing a report or config as JSON failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn checkpoint(msg: impl Into<String>) -> Self {
        Error::Checkpoint(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
