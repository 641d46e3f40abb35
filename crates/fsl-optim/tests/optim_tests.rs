// Integration tests for fsl-optim on the CPU backend.

use fsl_core::{DType, Result};
use fsl_cpu::{CpuDevice, CpuTensor};
use fsl_optim::{Adam, Optimizer, SGD};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn param(data: &[f64]) -> Result<CpuTensor> {
    Ok(CpuTensor::from_f64_slice(data, data.len(), DType::F64, &CpuDevice)?.set_variable())
}

/// Loss `sum((p - target)²)`.
fn quadratic(p: &CpuTensor, target: &[f64]) -> Result<CpuTensor> {
    let target = CpuTensor::from_f64_slice(target, target.len(), DType::F64, &CpuDevice)?;
    p.sub(&target)?.square()?.sum_all()
}

#[test]
fn test_sgd_plain_step() -> Result<()> {
    let p = param(&[1.0, -2.0])?;
    let mut opt = SGD::new(vec![p.clone()], 0.1, 0.0, 0.0);
    let grads = quadratic(&p, &[0.0, 0.0])?.backward()?;
    opt.step(&grads)?;
    // grad = 2p
    let v = p.to_f64_vec()?;
    assert!(approx_eq(v[0], 0.8, 1e-12));
    assert!(approx_eq(v[1], -1.6, 1e-12));
    Ok(())
}

#[test]
fn test_sgd_momentum_accumulates() -> Result<()> {
    let p = param(&[1.0])?;
    let mut opt = SGD::new(vec![p.clone()], 0.1, 0.9, 0.0);
    let g1 = quadratic(&p, &[0.0])?.backward()?;
    opt.step(&g1)?;
    // buf = 2.0, p = 1 - 0.2
    assert!(approx_eq(p.to_scalar_f64()?, 0.8, 1e-12));
    let g2 = quadratic(&p, &[0.0])?.backward()?;
    opt.step(&g2)?;
    // buf = 0.9 * 2.0 + 1.6 = 3.4, p = 0.8 - 0.34
    assert!(approx_eq(p.to_scalar_f64()?, 0.46, 1e-12));
    Ok(())
}

#[test]
fn test_sgd_weight_decay() -> Result<()> {
    let p = param(&[2.0])?;
    let mut opt = SGD::new(vec![p.clone()], 0.5, 0.0, 0.1);
    // zero loss gradient, decay only: p -= 0.5 * 0.1 * 2
    let grads = p.mul(&CpuTensor::zeros(1, DType::F64, &CpuDevice)?)?.sum_all()?.backward()?;
    opt.step(&grads)?;
    assert!(approx_eq(p.to_scalar_f64()?, 1.9, 1e-12));
    Ok(())
}

#[test]
fn test_parameters_without_gradient_are_untouched() -> Result<()> {
    let used = param(&[1.0])?;
    let unused = param(&[5.0])?;
    let mut opt = Adam::new(vec![used.clone(), unused.clone()], 0.1);
    let grads = quadratic(&used, &[0.0])?.backward()?;
    opt.step(&grads)?;
    assert!(approx_eq(unused.to_scalar_f64()?, 5.0, 0.0));
    assert!(used.to_scalar_f64()? < 1.0);
    Ok(())
}

#[test]
fn test_adam_first_step_moves_by_lr() -> Result<()> {
    // with bias correction the first step is lr * sign(g) (up to epsilon)
    let p = param(&[3.0, -3.0])?;
    let mut opt = Adam::new(vec![p.clone()], 0.01);
    let grads = quadratic(&p, &[0.0, 0.0])?.backward()?;
    opt.step(&grads)?;
    let v = p.to_f64_vec()?;
    assert!(approx_eq(v[0], 2.99, 1e-6));
    assert!(approx_eq(v[1], -2.99, 1e-6));
    assert_eq!(opt.step_count(), 1);
    Ok(())
}

#[test]
fn test_adam_converges_on_quadratic() -> Result<()> {
    let p = param(&[4.0, -1.0, 0.5])?;
    let target = [1.0, 2.0, -3.0];
    let mut opt = Adam::new(vec![p.clone()], 0.1);
    for _ in 0..500 {
        let grads = quadratic(&p, &target)?.backward()?;
        opt.step(&grads)?;
    }
    for (got, want) in p.to_f64_vec()?.iter().zip(target) {
        assert!(approx_eq(*got, want, 1e-2), "{} vs {}", got, want);
    }
    Ok(())
}

#[test]
fn test_learning_rate_accessors() {
    let mut opt: SGD<fsl_cpu::CpuBackend> = SGD::new(Vec::new(), 0.1, 0.9, 0.0);
    assert_eq!(opt.learning_rate(), 0.1);
    opt.set_learning_rate(0.01);
    assert_eq!(opt.learning_rate(), 0.01);
    assert_eq!(opt.momentum(), 0.9);
    assert!(opt.params().is_empty());
}
