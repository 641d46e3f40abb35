//! # fsl-nn
//!
//! Stateless network building blocks for fsl.
//!
//! 1. **init**: Kaiming / Xavier / constant parameter initializers
//! 2. **loss**: cross-entropy (one-hot or label targets), MSE
//! 3. **functional**: `batch_norm2d` and `linear` over explicit parameters
//! 4. **metrics**: argmax predictions and accuracy
//!
//! Nothing here owns parameters; the config executor in `fsl-meta` passes
//! them in on every call.

pub mod functional;
pub mod init;
pub mod loss;
pub mod metrics;

pub use functional::{batch_norm2d, linear, BatchNormParams, BN_EPS, BN_MOMENTUM};
pub use init::FanMode;
pub use loss::{cross_entropy_loss, cross_entropy_with_labels, mse_loss, one_hot};
pub use metrics::{accuracy, argmax_classes, logits_accuracy};
