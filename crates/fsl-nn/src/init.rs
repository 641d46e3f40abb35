// Parameter initialization
//
// Free functions that allocate a freshly initialized, trainable tensor.
// The parameter store calls these once per slot when a layer config is
// initialized; everything returned here already has `set_variable()`.
//
//   uniform(shape, low, high)        U(low, high)
//   normal(shape, mean, std)         N(mean, std)
//   zeros / ones                     constants
//   xavier_uniform(shape, gain)      Glorot uniform
//   kaiming_uniform(shape, a, mode)  He uniform
//   kaiming_normal(shape, a, mode)   He normal (conv and linear weights)

use fsl_core::{Backend, DType, Result, Shape, Tensor};

/// Which fan Kaiming initialization scales by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanMode {
    /// Preserve activation variance in the forward pass.
    #[default]
    FanIn,
    /// Preserve gradient variance in the backward pass.
    FanOut,
}

/// `(fan_in, fan_out)` of a weight shape.
///
/// Conv weights are `[out, in, kh, kw]`, so the receptive field multiplies
/// both fans. Linear weights are `[out, in]`.
pub fn compute_fans(shape: &Shape) -> (f64, f64) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        _ => {
            let receptive: usize = dims[2..].iter().product();
            (
                (dims[1] * receptive) as f64,
                (dims[0] * receptive) as f64,
            )
        }
    }
}

pub fn uniform<B: Backend>(
    shape: impl Into<Shape>,
    low: f64,
    high: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Ok(Tensor::<B>::rand(shape, dtype, device)?
        .affine(high - low, low)?
        .set_variable())
}

pub fn normal<B: Backend>(
    shape: impl Into<Shape>,
    mean: f64,
    std: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Ok(Tensor::<B>::randn(shape, dtype, device)?
        .affine(std, mean)?
        .set_variable())
}

pub fn zeros<B: Backend>(
    shape: impl Into<Shape>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Ok(Tensor::<B>::zeros(shape, dtype, device)?.set_variable())
}

pub fn ones<B: Backend>(
    shape: impl Into<Shape>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Ok(Tensor::<B>::ones(shape, dtype, device)?.set_variable())
}

/// Glorot uniform: U(-b, b) with b = gain * sqrt(6 / (fan_in + fan_out)).
pub fn xavier_uniform<B: Backend>(
    shape: impl Into<Shape>,
    gain: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let (fan_in, fan_out) = compute_fans(&shape);
    let bound = gain * (6.0 / (fan_in + fan_out)).sqrt();
    uniform::<B>(shape, -bound, bound, dtype, device)
}

fn kaiming_fan(shape: &Shape, mode: FanMode) -> f64 {
    let (fan_in, fan_out) = compute_fans(shape);
    match mode {
        FanMode::FanIn => fan_in,
        FanMode::FanOut => fan_out,
    }
}

/// He uniform: U(-b, b) with b = sqrt(6 / ((1 + a²) * fan)).
///
/// `a` is the negative slope of the following rectifier (0 for ReLU).
pub fn kaiming_uniform<B: Backend>(
    shape: impl Into<Shape>,
    a: f64,
    mode: FanMode,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let fan = kaiming_fan(&shape, mode);
    let gain_sq = 2.0 / (1.0 + a * a);
    let bound = (3.0 * gain_sq / fan).sqrt();
    uniform::<B>(shape, -bound, bound, dtype, device)
}

/// He normal: N(0, std) with std = sqrt(2 / ((1 + a²) * fan)).
pub fn kaiming_normal<B: Backend>(
    shape: impl Into<Shape>,
    a: f64,
    mode: FanMode,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let fan = kaiming_fan(&shape, mode);
    let std = (2.0 / ((1.0 + a * a) * fan)).sqrt();
    normal::<B>(shape, 0.0, std, dtype, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fans_for_conv_and_linear() {
        assert_eq!(compute_fans(&Shape::from((32, 3, 3, 3))), (27.0, 288.0));
        assert_eq!(compute_fans(&Shape::from((5, 288))), (288.0, 5.0));
        assert_eq!(compute_fans(&Shape::from(7)), (7.0, 7.0));
    }

    #[test]
    fn test_fan_mode_default_is_fan_in() {
        assert_eq!(FanMode::default(), FanMode::FanIn);
    }
}
