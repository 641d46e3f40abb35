// Config executor
//
// `forward(config, params, input, mode)` is a pure function of its arguments
// apart from batch-norm running statistics, which train-mode passes update in
// place. Nothing is owned by "modules": every weight comes from the supplied
// ParameterCollection, so the same config runs against the meta parameters
// and against a per-task adapted copy, and gradients flow to whichever
// collection was supplied.
//
// FLOW:
//   1. The collection's slot layout is checked against the config.
//   2. Shapes are propagated symbolically (see infer.rs); any declared
//      argument that does not fit the input fails before computation.
//   3. Layers run in order. identity_in pushes the activation on a LIFO
//      stack; identity_out pops it and adds it back, through a 1x1 conv + bn
//      projection when the marker pair declares channel counts.

use fsl_core::{Backend, Tensor, Window};
use fsl_nn::{batch_norm2d, linear, BatchNormParams, BN_EPS, BN_MOMENTUM};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{LayerConfig, LayerSpec};
use crate::error::{Error, Result};
use crate::infer::{check_closed, projection_stride, step_dims};
use crate::params::ParameterCollection;

/// Batch-norm behaviour for a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Batch statistics; running statistics are updated.
    Train,
    /// Running statistics only; nothing is written.
    #[default]
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }
}

fn bn_params<B: Backend>(slots: &[Tensor<B>], first: usize) -> BatchNormParams<'_, B> {
    BatchNormParams {
        scale: &slots[first],
        shift: &slots[first + 1],
        running_mean: &slots[first + 2],
        running_var: &slots[first + 3],
    }
}

fn bn<B: Backend>(x: &Tensor<B>, slots: &[Tensor<B>], first: usize, mode: Mode) -> Result<Tensor<B>> {
    Ok(batch_norm2d(
        x,
        bn_params(slots, first),
        mode.is_train(),
        BN_MOMENTUM,
        BN_EPS,
    )?)
}

/// conv3x3 → bn → relu → conv3x3 → bn (+ x when the shape is preserved) → relu.
///
/// Slots: conv1.weight, bn1 (4), conv2.weight, bn2 (4).
fn basic_block<B: Backend>(
    x: &Tensor<B>,
    slots: &[Tensor<B>],
    preserves_shape: bool,
    stride: usize,
    mode: Mode,
) -> Result<Tensor<B>> {
    let h = x.conv2d(&slots[0], None, [stride, stride], [1, 1])?;
    let h = bn(&h, slots, 1, mode)?.relu()?;
    let h = h.conv2d(&slots[5], None, [1, 1], [1, 1])?;
    let h = bn(&h, slots, 6, mode)?;
    let h = if preserves_shape { h.add(x)? } else { h };
    Ok(h.relu()?)
}

/// Skip path of an identity_out: the stashed activation itself, or its
/// 1x1 conv + bn projection onto the current activation's shape.
fn skip_path<B: Backend>(
    layer: usize,
    stashed: &Tensor<B>,
    current: &Tensor<B>,
    slots: &[Tensor<B>],
    mode: Mode,
) -> Result<Tensor<B>> {
    if slots.is_empty() {
        return Ok(stashed.clone());
    }
    let (s, c) = (stashed.dims(), current.dims());
    let stride = projection_stride([s[2], s[3]], [c[2], c[3]]).ok_or_else(|| Error::Shape {
        layer,
        kind: "identity_out",
        msg: format!("no projection stride maps {:?} onto {:?}", s, c),
    })?;
    let projected = stashed.conv2d(&slots[0], None, [stride, stride], [0, 0])?;
    bn(&projected, slots, 1, mode)
}

/// Run `config` on `input` with the tensors of `params`.
pub fn forward<B: Backend>(
    config: &LayerConfig,
    params: &ParameterCollection<B>,
    input: &Tensor<B>,
    mode: Mode,
) -> Result<Tensor<B>> {
    let layout = config.slot_layout()?;
    params.check_layout(&layout)?;

    let mut dim_stack = Vec::new();
    let mut dims = input.dims().to_vec();
    for (i, spec) in config.iter().enumerate() {
        dims = step_dims(i, spec, &dims, &mut dim_stack)?;
    }
    check_closed(&dim_stack)?;

    let tensors = params.tensors();
    let mut stash: Vec<(usize, Tensor<B>)> = Vec::new();
    let mut x = input.clone();

    for (i, spec) in config.iter().enumerate() {
        let slots = &tensors[layout.ranges[i].clone()];
        x = match *spec {
            LayerSpec::Conv2d { stride, pad, .. } => {
                x.conv2d(&slots[0], Some(&slots[1]), [stride, stride], [pad, pad])?
            }
            LayerSpec::Relu { .. } => x.relu()?,
            LayerSpec::BatchNorm { .. } => bn(&x, slots, 0, mode)?,
            LayerSpec::MaxPool2d {
                kernel,
                stride,
                pad,
            } => x.max_pool2d(Window::square(kernel, stride, pad))?,
            LayerSpec::AvgPool2d {
                kernel,
                stride,
                pad,
            } => x.avg_pool2d(Window::square(kernel, stride, pad))?,
            LayerSpec::Flatten => x.flatten(1, x.rank() - 1)?,
            LayerSpec::Linear { .. } => linear(&x, &slots[0], Some(&slots[1]))?,
            LayerSpec::BasicBlock {
                out_ch,
                in_ch,
                stride,
                ..
            } => basic_block(&x, slots, in_ch == out_ch && stride == 1, stride, mode)?,
            LayerSpec::IdentityIn { .. } => {
                stash.push((i, x.clone()));
                x
            }
            LayerSpec::IdentityOut { .. } => {
                let (_, stashed) = stash.pop().ok_or_else(|| Error::UnmatchedIdentity {
                    layer: i,
                    msg: "identity_out without a preceding identity_in".into(),
                })?;
                let skip = skip_path(i, &stashed, &x, slots, mode)?;
                x.add(&skip)?
            }
        };
        debug!(layer = i, kind = %spec.kind(), dims = ?x.dims(), "executed layer");
    }
    Ok(x)
}
