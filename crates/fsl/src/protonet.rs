// ProtoNet — nearest-prototype classification with a cosine classifier
//
//   prototypes[k] = mean of the support embeddings labelled k
//   logits        = scale_cls * (cos(query, prototypes) + bias)
//
// Prototypes come from a one-hot matmul so the whole head stays
// differentiable w.r.t. the backbone parameters; the fine-tuning heads
// backpropagate through it.

use fsl_core::{Backend, DType, Tensor};
use fsl_meta::Task;
use fsl_nn::one_hot;

use crate::backbone::{Backbone, ConfigBackbone};
use crate::error::Result;

pub const DEFAULT_SCALE_CLS: f64 = 10.0;

const NORM_EPS: f64 = 1e-12;

/// Mean support embedding per class, `[num_ways, D]`.
///
/// Every class must have at least one support example.
pub fn prototypes<B: Backend>(
    support_f: &Tensor<B>,
    support_y: &[usize],
    num_ways: usize,
) -> Result<Tensor<B>> {
    let (dtype, device) = (support_f.dtype(), support_f.device());
    let onehot = one_hot::<B>(support_y, num_ways, dtype, device)?;
    let counts = onehot.sum(0, false)?.to_f64_vec()?;
    if let Some(k) = counts.iter().position(|&c| c == 0.0) {
        return Err(fsl_meta::Error::InvalidTask(format!("class {} has no support example", k)).into());
    }
    let inv: Vec<f64> = counts.iter().map(|c| 1.0 / c).collect();
    let inv = Tensor::<B>::from_f64_slice(&inv, (num_ways, 1), dtype, device)?;
    Ok(onehot.t()?.matmul(support_f)?.mul(&inv)?)
}

/// Rows scaled to unit L2 norm.
fn l2_normalize<B: Backend>(x: &Tensor<B>) -> Result<Tensor<B>> {
    let norm = x.square()?.sum(1, true)?.sqrt()?.affine(1.0, NORM_EPS)?;
    Ok(x.div(&norm)?)
}

pub struct ProtoNet<B: Backend> {
    backbone: ConfigBackbone<B>,
    num_ways: usize,
    scale_cls: Tensor<B>,
    bias: Tensor<B>,
}

impl<B: Backend> ProtoNet<B> {
    pub fn new(backbone: ConfigBackbone<B>, num_ways: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        if num_ways == 0 {
            return Err(fsl_meta::Error::config("num_ways must be positive").into());
        }
        let scale_cls = Tensor::<B>::full(1, DEFAULT_SCALE_CLS, dtype, device)?.set_variable();
        let bias = Tensor::<B>::full(1, 0.0, dtype, device)?.set_variable();
        Ok(ProtoNet {
            backbone,
            num_ways,
            scale_cls,
            bias,
        })
    }

    pub fn backbone(&self) -> &ConfigBackbone<B> {
        &self.backbone
    }

    pub fn num_ways(&self) -> usize {
        self.num_ways
    }

    pub fn scale_cls(&self) -> &Tensor<B> {
        &self.scale_cls
    }

    pub fn bias(&self) -> &Tensor<B> {
        &self.bias
    }

    /// `scale_cls * (cos(features, prototypes) + bias)`, `[N, num_ways]`.
    pub fn cos_classifier(&self, prototypes: &Tensor<B>, features: &Tensor<B>) -> Result<Tensor<B>> {
        let w = l2_normalize(prototypes)?;
        let f = l2_normalize(features)?;
        let scores = f.matmul(&w.t()?)?;
        Ok(scores.add(&self.bias)?.mul(&self.scale_cls)?)
    }

    /// Logits of `features` against the prototypes of `support_f`.
    pub fn classify(&self, support_f: &Tensor<B>, support_y: &[usize], features: &Tensor<B>) -> Result<Tensor<B>> {
        let protos = prototypes(support_f, support_y, self.num_ways)?;
        self.cos_classifier(&protos, features)
    }

    /// Query logits of `task` with `embed` as the feature extractor.
    pub fn logits_from<F>(&self, embed: F, task: &Task<B>) -> Result<Tensor<B>>
    where
        F: Fn(&Tensor<B>) -> Result<Tensor<B>>,
    {
        let support_f = embed(&task.support_x)?;
        let query_f = embed(&task.query_x)?;
        self.classify(&support_f, &task.support_y, &query_f)
    }

    /// Query logits `[N_q, num_ways]`.
    pub fn predict(&self, task: &Task<B>) -> Result<Tensor<B>> {
        task.validate(self.num_ways)?;
        self.logits_from(|x| self.backbone.forward(x), task)
    }
}
