//! # fsl-optim
//!
//! First-order optimizers over `fsl-core` tensors.
//!
//! - [`SGD`]: momentum and weight decay (fine-tuning heads)
//! - [`Adam`]: bias-corrected Adam (meta-learning outer loop)
//!
//! Both update parameter storage in place from a [`fsl_core::GradStore`].

pub mod adam;
pub mod optimizer;
pub mod sgd;

pub use adam::Adam;
pub use optimizer::Optimizer;
pub use sgd::SGD;
