//! # fsl
//!
//! Few-shot image classification built on a config-driven network executor.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fsl::prelude::*;
//!
//! let args = ModelArgs { deploy: "maml".into(), ..ModelArgs::default() };
//! let model = get_model::<CpuBackend>(&args, &BackboneRegistry::new(), DType::F32, &CpuDevice)?;
//! let logits = model.predict(&task)?;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `fsl-core` | Tensor, Shape, DType, Layout, Backend trait, higher-order autograd |
//! | `fsl-cpu` | CPU backend with rayon parallelism |
//! | `fsl-nn` | Initializers, losses, functional batch norm / linear, metrics |
//! | `fsl-optim` | Optimizers (SGD, Adam) |
//! | `fsl-meta` | Layer configs, parameter collections, executor, MAML controller |
//!
//! ## Modules
//!
//! - [`backbone`]: backbone trait, config backbones, architecture registry
//! - [`protonet`]: prototype head with a cosine classifier
//! - [`finetune`]: per-episode fine-tuning heads
//! - [`model`]: `ModelArgs` and the `get_model` factory
//! - [`checkpoint`]: save / load parameter collections
//! - [`episode`]: synthetic episodes
//! - [`logging`]: subscriber setup for the binary

pub use fsl_core::{Backend, DType, GradStore, Shape, Tensor};
pub use fsl_cpu::{CpuBackend, CpuDevice, CpuTensor};

pub mod nn {
    pub use fsl_nn::*;
}

pub mod optim {
    pub use fsl_optim::*;
}

pub mod meta {
    pub use fsl_meta::*;
}

pub mod backbone;
pub mod checkpoint;
pub mod episode;
pub mod error;
pub mod finetune;
pub mod logging;
pub mod model;
pub mod protonet;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::backbone::{Backbone, BackboneRegistry, ConfigBackbone};
    pub use crate::episode::{synthetic_task, EpisodeConfig};
    pub use crate::finetune::{ProtoNetAutoFinetune, ProtoNetFinetune};
    pub use crate::model::{get_model, Deploy, FewShotModel, ModelArgs};
    pub use crate::protonet::ProtoNet;
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, Tensor};
    pub use fsl_meta::prelude::*;
}
