//! # fsl-meta
//!
//! A config-driven network executor with externalized parameters, and a
//! second-order MAML controller built on it.
//!
//! | Module       | Role |
//! |--------------|------|
//! | `config`     | `LayerConfig`: ordered, validated `(kind, args)` layer list; builders |
//! | `params`     | `ParameterCollection`: flat ordered slots allocated from a config |
//! | `infer`      | symbolic shape propagation |
//! | `executor`   | `forward(config, params, input, mode)` |
//! | `task`       | support / query episodes |
//! | `controller` | `MetaLearner`: INIT → ADAPT → EVALUATE, outer Adam step |
//!
//! ```ignore
//! use fsl_meta::prelude::*;
//!
//! let mut learner = MetaLearner::<CpuBackend>::new(
//!     MetaSettings::default(),
//!     &conv4_no_classifier(),
//!     &[1, 3, 84, 84],
//!     DType::F32,
//!     &CpuDevice,
//! )?;
//! let report = learner.meta_train_step(&tasks)?;
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod infer;
pub mod params;
pub mod task;

pub use config::{Arg, LayerConfig, LayerKind, LayerSpec};
pub use controller::{
    Adaptation, Evaluation, MetaLearner, MetaSettings, MetaStepReport, StepSize, TaskOutcome,
};
pub use error::{Error, Result};
pub use executor::{forward, Mode};
pub use params::{ParameterCollection, SlotLayout, SlotRole, SlotSpec};
pub use task::Task;

pub mod prelude {
    pub use crate::config::{
        classifier, conv4_backbone, conv4_no_classifier, resnet18, resnet18_no_head,
    };
    pub use crate::{
        forward, Arg, LayerConfig, LayerKind, LayerSpec, MetaLearner, MetaSettings, Mode,
        ParameterCollection, StepSize, Task,
    };
    pub use fsl_core::{DType, Tensor};
}
