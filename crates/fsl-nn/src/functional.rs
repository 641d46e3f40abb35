// Functional layers
//
// Layers here own no state: weights and buffers are explicit arguments.
// That is what lets the same network run against the meta parameters and
// against a per-task adapted copy.
//
// BATCH NORM (2-D, per channel over N, H, W):
//
//   training:  y = (x - mean_b) / sqrt(var_b + eps) * scale + shift
//              running_mean <- (1 - momentum) * running_mean + momentum * mean_b
//              running_var  <- (1 - momentum) * running_var  + momentum * var_b_unbiased
//   eval:      y = (x - running_mean) / sqrt(running_var + eps) * scale + shift
//
// Running statistics are written in place through `update_data_inplace`, so
// the write is visible to every holder of the buffer and is never recorded
// in the autograd graph.

use fsl_core::{Backend, Error, Result, Shape, Tensor};

pub const BN_EPS: f64 = 1e-5;
pub const BN_MOMENTUM: f64 = 0.1;

/// Buffers and affine parameters of one batch-norm layer, all `[C]`.
pub struct BatchNormParams<'a, B: Backend> {
    pub scale: &'a Tensor<B>,
    pub shift: &'a Tensor<B>,
    pub running_mean: &'a Tensor<B>,
    pub running_var: &'a Tensor<B>,
}

impl<B: Backend> Clone for BatchNormParams<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for BatchNormParams<'_, B> {}

/// Batch-normalize `[N, C, H, W]` per channel.
///
/// In training mode the batch statistics normalize the input and the running
/// statistics are refreshed; in eval mode the running statistics are only read.
pub fn batch_norm2d<B: Backend>(
    x: &Tensor<B>,
    params: BatchNormParams<'_, B>,
    training: bool,
    momentum: f64,
    eps: f64,
) -> Result<Tensor<B>> {
    if x.rank() != 4 {
        return Err(Error::RankMismatch {
            expected: 4,
            got: x.rank(),
        });
    }
    let dims = x.dims();
    let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    for t in [
        params.scale,
        params.shift,
        params.running_mean,
        params.running_var,
    ] {
        if t.dims() != [c] {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(c),
                got: t.shape().clone(),
            });
        }
    }
    let channel = |t: &Tensor<B>| t.reshape((1, c, 1, 1));

    let x_hat = if training {
        let mean = x.mean_dims(&[0, 2, 3], true)?;
        let var = x.var_dims(&[0, 2, 3], true)?;

        let count = (n * h * w) as f64;
        let correction = if count > 1.0 { count / (count - 1.0) } else { 1.0 };
        let mean_host = mean.to_f64_vec()?;
        let var_host = var.to_f64_vec()?;
        let rm = params.running_mean.to_f64_vec()?;
        let rv = params.running_var.to_f64_vec()?;
        let new_rm: Vec<f64> = rm
            .iter()
            .zip(&mean_host)
            .map(|(r, m)| (1.0 - momentum) * r + momentum * m)
            .collect();
        let new_rv: Vec<f64> = rv
            .iter()
            .zip(&var_host)
            .map(|(r, v)| (1.0 - momentum) * r + momentum * v * correction)
            .collect();
        params.running_mean.update_data_inplace(&new_rm)?;
        params.running_var.update_data_inplace(&new_rv)?;

        x.sub(&mean)?.div(&var.affine(1.0, eps)?.sqrt()?)?
    } else {
        let mean = channel(&params.running_mean.detach())?;
        let std = channel(&params.running_var.detach())?
            .affine(1.0, eps)?
            .sqrt()?;
        x.sub(&mean)?.div(&std)?
    };

    x_hat
        .mul(&channel(params.scale)?)?
        .add(&channel(params.shift)?)
}

/// Fully connected layer: `x @ weight^T + bias` with `weight` `[out, in]`.
pub fn linear<B: Backend>(
    x: &Tensor<B>,
    weight: &Tensor<B>,
    bias: Option<&Tensor<B>>,
) -> Result<Tensor<B>> {
    if x.rank() != 2 || weight.rank() != 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: x.rank().min(weight.rank()),
        });
    }
    let out = x.matmul(&weight.t()?)?;
    match bias {
        Some(b) => out.add(b),
        None => Ok(out),
    }
}
