// Integration tests for fsl-nn on the CPU backend.

use fsl_core::{DType, Result, Tensor};
use fsl_cpu::{CpuBackend, CpuDevice, CpuTensor};
use fsl_nn::init::{kaiming_normal, kaiming_uniform, xavier_uniform};
use fsl_nn::{
    argmax_classes, batch_norm2d, cross_entropy_loss, cross_entropy_with_labels, linear,
    logits_accuracy, one_hot, BatchNormParams, FanMode, BN_EPS, BN_MOMENTUM,
};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn t(data: &[f64], shape: &[usize]) -> Result<CpuTensor> {
    CpuTensor::from_f64_slice(data, shape.to_vec(), DType::F64, &CpuDevice)
}

fn mean_std(v: &[f64]) -> (f64, f64) {
    let n = v.len() as f64;
    let mean = v.iter().sum::<f64>() / n;
    let var = v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

struct BnState {
    scale: CpuTensor,
    shift: CpuTensor,
    running_mean: CpuTensor,
    running_var: CpuTensor,
}

impl BnState {
    fn new(c: usize) -> Result<Self> {
        Ok(BnState {
            scale: CpuTensor::ones(c, DType::F64, &CpuDevice)?.set_variable(),
            shift: CpuTensor::zeros(c, DType::F64, &CpuDevice)?.set_variable(),
            running_mean: CpuTensor::zeros(c, DType::F64, &CpuDevice)?,
            running_var: CpuTensor::ones(c, DType::F64, &CpuDevice)?,
        })
    }

    fn params(&self) -> BatchNormParams<'_, CpuBackend> {
        BatchNormParams {
            scale: &self.scale,
            shift: &self.shift,
            running_mean: &self.running_mean,
            running_var: &self.running_var,
        }
    }
}

// Initializers

#[test]
fn test_kaiming_normal_scale() -> Result<()> {
    let w: CpuTensor = kaiming_normal((64, 32, 3, 3), 0.0, FanMode::FanIn, DType::F64, &CpuDevice)?;
    assert!(w.is_variable());
    let (mean, std) = mean_std(&w.to_f64_vec()?);
    let expected = (2.0 / 288.0f64).sqrt();
    assert!(mean.abs() < 0.01, "mean {}", mean);
    assert!((std - expected).abs() / expected < 0.05, "std {} vs {}", std, expected);
    Ok(())
}

#[test]
fn test_kaiming_uniform_bounds() -> Result<()> {
    let w: CpuTensor = kaiming_uniform((50, 100), 0.0, FanMode::FanIn, DType::F32, &CpuDevice)?;
    let bound = (6.0 / 100.0f64).sqrt();
    for x in w.to_f64_vec()? {
        assert!(x.abs() <= bound + 1e-6, "{} outside ±{}", x, bound);
    }
    Ok(())
}

#[test]
fn test_xavier_uniform_bounds() -> Result<()> {
    let w: CpuTensor = xavier_uniform((10, 30), 1.0, DType::F64, &CpuDevice)?;
    let bound = (6.0 / 40.0f64).sqrt();
    assert!(w.to_f64_vec()?.iter().all(|x| x.abs() <= bound));
    Ok(())
}

// Losses

#[test]
fn test_one_hot() -> Result<()> {
    let oh = one_hot::<CpuBackend>(&[2, 0], 3, DType::F64, &CpuDevice)?;
    assert_eq!(oh.dims(), &[2, 3]);
    assert_vec_approx(&oh.to_f64_vec()?, &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0], 0.0);
    assert!(one_hot::<CpuBackend>(&[3], 3, DType::F64, &CpuDevice).is_err());
    Ok(())
}

#[test]
fn test_cross_entropy_uniform_logits() -> Result<()> {
    let logits = CpuTensor::zeros((4, 5), DType::F64, &CpuDevice)?;
    let loss = cross_entropy_with_labels(&logits, &[0, 1, 2, 3])?;
    assert!(approx_eq(loss.to_scalar_f64()?, 5.0f64.ln(), 1e-12));
    Ok(())
}

#[test]
fn test_cross_entropy_labels_match_one_hot() -> Result<()> {
    let logits = t(&[1.0, -2.0, 0.5, 0.3, 0.0, 2.0], &[2, 3])?;
    let a = cross_entropy_with_labels(&logits, &[2, 1])?.to_scalar_f64()?;
    let target = one_hot::<CpuBackend>(&[2, 1], 3, DType::F64, &CpuDevice)?;
    let b = cross_entropy_loss(&logits, &target)?.to_scalar_f64()?;
    assert!(approx_eq(a, b, 1e-12));
    assert!(cross_entropy_with_labels(&logits, &[0]).is_err());
    Ok(())
}

#[test]
fn test_cross_entropy_gradient_is_softmax_minus_target() -> Result<()> {
    let logits = t(&[0.2, -0.4, 1.1], &[1, 3])?.set_variable();
    let grads = cross_entropy_with_labels(&logits, &[1])?.backward()?;
    let g = grads.get(&logits).expect("logits grad").to_f64_vec()?;
    let p = logits.softmax(1)?.to_f64_vec()?;
    assert_vec_approx(&g, &[p[0], p[1] - 1.0, p[2]], 1e-12);
    Ok(())
}

// Functional layers

#[test]
fn test_linear_values() -> Result<()> {
    let x = t(&[1.0, 2.0], &[1, 2])?;
    let w = t(&[1.0, 0.0, 0.5, -1.0, 2.0, 3.0], &[3, 2])?;
    let b = t(&[0.1, 0.2, 0.3], &[3])?;
    let y = linear(&x, &w, Some(&b))?;
    assert_eq!(y.dims(), &[1, 3]);
    assert_vec_approx(&y.to_f64_vec()?, &[1.1, -1.3, 8.3], 1e-12);
    assert!(linear(&x, &t(&[1.0; 3], &[1, 3])?, None).is_err());
    Ok(())
}

#[test]
fn test_batch_norm_train_normalizes_and_tracks_stats() -> Result<()> {
    // channel 0: 1..4, channel 1: constant 5
    let x = t(&[1.0, 2.0, 5.0, 5.0, 3.0, 4.0, 5.0, 5.0], &[2, 2, 1, 2])?;
    let bn = BnState::new(2)?;
    let y = batch_norm2d(&x, bn.params(), true, BN_MOMENTUM, BN_EPS)?;
    let v = y.to_f64_vec()?;
    let s = (1.25f64 + BN_EPS).sqrt();
    assert_vec_approx(
        &v,
        &[-1.5 / s, -0.5 / s, 0.0, 0.0, 0.5 / s, 1.5 / s, 0.0, 0.0],
        1e-9,
    );

    // unbiased variance of 1..4 is 5/3
    assert_vec_approx(&bn.running_mean.to_f64_vec()?, &[0.25, 0.5], 1e-12);
    assert_vec_approx(
        &bn.running_var.to_f64_vec()?,
        &[0.9 + 0.1 * 5.0 / 3.0, 0.9],
        1e-12,
    );
    Ok(())
}

#[test]
fn test_batch_norm_eval_reads_running_stats() -> Result<()> {
    let x = t(&[1.0, 3.0], &[1, 2, 1, 1])?;
    let bn = BnState::new(2)?;
    bn.running_mean.update_data_inplace(&[1.0, -1.0])?;
    bn.running_var.update_data_inplace(&[4.0, 1.0])?;
    bn.scale.update_data_inplace(&[2.0, 1.0])?;
    bn.shift.update_data_inplace(&[0.5, 0.0])?;

    let y = batch_norm2d(&x, bn.params(), false, BN_MOMENTUM, BN_EPS)?;
    let expected = [0.5, 4.0 / (1.0 + BN_EPS).sqrt()];
    assert_vec_approx(&y.to_f64_vec()?, &expected, 1e-9);
    assert_vec_approx(&bn.running_mean.to_f64_vec()?, &[1.0, -1.0], 0.0);
    assert_vec_approx(&bn.running_var.to_f64_vec()?, &[4.0, 1.0], 0.0);
    Ok(())
}

#[test]
fn test_batch_norm_channel_mismatch() -> Result<()> {
    let x = CpuTensor::zeros((1, 3, 2, 2), DType::F64, &CpuDevice)?;
    let bn = BnState::new(2)?;
    assert!(batch_norm2d(&x, bn.params(), true, BN_MOMENTUM, BN_EPS).is_err());
    Ok(())
}

#[test]
fn test_batch_norm_train_gradient_matches_finite_differences() -> Result<()> {
    let data = [0.3, -1.2, 0.8, 2.0, -0.5, 0.1, 1.4, -0.9];
    let weights = [1.0, -2.0, 0.5, 3.0, 1.5, -1.0, 2.0, 0.7];
    let bn = BnState::new(2)?;
    bn.scale.update_data_inplace(&[1.3, 0.7])?;
    let loss_at = |d: &[f64]| -> Result<(CpuTensor, CpuTensor)> {
        let x = t(d, &[2, 2, 2, 1])?.set_variable();
        let y = batch_norm2d(&x, bn.params(), true, BN_MOMENTUM, BN_EPS)?;
        let loss = y.mul(&t(&weights, &[2, 2, 2, 1])?)?.square()?.sum_all()?;
        Ok((x, loss))
    };

    let (x, loss) = loss_at(&data)?;
    let analytic = loss.backward()?.get(&x).expect("x grad").to_f64_vec()?;
    let eps = 1e-6;
    for i in 0..data.len() {
        let mut p = data;
        let mut m = data;
        p[i] += eps;
        m[i] -= eps;
        let numeric =
            (loss_at(&p)?.1.to_scalar_f64()? - loss_at(&m)?.1.to_scalar_f64()?) / (2.0 * eps);
        assert!(
            approx_eq(analytic[i], numeric, 1e-4),
            "index {}: {} vs {}",
            i,
            analytic[i],
            numeric
        );
    }
    Ok(())
}

// Metrics

#[test]
fn test_argmax_and_accuracy() -> Result<()> {
    let logits: Tensor<CpuBackend> = t(&[0.1, 0.9, 0.0, 2.0, 2.0, 1.0], &[2, 3])?;
    assert_eq!(argmax_classes(&logits)?, vec![1, 0]);
    assert!(approx_eq(logits_accuracy(&logits, &[1, 2])?, 0.5, 1e-12));
    assert!(logits_accuracy(&logits, &[1]).is_err());
    Ok(())
}
