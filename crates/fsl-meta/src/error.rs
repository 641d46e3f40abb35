// Error taxonomy of the config executor and the meta-learning controller.
//
//   Config             malformed layer config (arity, argument types, unknown kind)
//   Shape              activation or parameter shape inconsistent with the config
//   UnmatchedIdentity  identity_in / identity_out markers do not pair up
//   AdaptationDiverged non-finite loss during inner-loop adaptation
//   InvalidTask        task tensors or labels inconsistent with the learner
//
// Tensor-level failures from fsl-core pass through unchanged.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("shape error at layer {layer} ({kind}): {msg}")]
    Shape {
        layer: usize,
        kind: &'static str,
        msg: String,
    },

    #[error("unmatched identity marker at layer {layer}: {msg}")]
    UnmatchedIdentity { layer: usize, msg: String },

    #[error("adaptation diverged at inner step {step}: loss = {loss}")]
    AdaptationDiverged { step: usize, loss: f64 },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error(transparent)]
    Tensor(#[from] fsl_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error aborts only the current task (and not the meta-batch).
    pub fn is_task_local(&self) -> bool {
        matches!(self, Error::AdaptationDiverged { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
