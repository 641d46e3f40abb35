// Integration tests for fsl-core on the CPU backend.
//
// Besides forward values, these check gradients against finite differences
// and verify that gradients can themselves be differentiated.

use std::sync::Arc;

use fsl_core::{DType, Error, Result, Tensor, Window};
use fsl_cpu::{CpuBackend, CpuDevice, CpuTensor};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
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

fn var(data: &[f64], shape: &[usize]) -> Result<CpuTensor> {
    Ok(t(data, shape)?.set_variable())
}

/// Deterministic pseudo-random values in [-1, 1).
fn pseudo(n: usize, seed: u64) -> Vec<f64> {
    let mut s = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..n)
        .map(|_| {
            s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((s >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
        })
        .collect()
}

/// Central finite differences of `f` at `x`.
fn numeric_grad(x: &[f64], f: impl Fn(&[f64]) -> Result<f64>) -> Result<Vec<f64>> {
    let eps = 1e-6;
    let mut out = Vec::with_capacity(x.len());
    for i in 0..x.len() {
        let mut p = x.to_vec();
        let mut m = x.to_vec();
        p[i] += eps;
        m[i] -= eps;
        out.push((f(&p)? - f(&m)?) / (2.0 * eps));
    }
    Ok(out)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// Element-wise and reductions

#[test]
fn test_broadcast_add() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?;
    let b = t(&[10.0, 20.0, 30.0], &[3])?;
    let c = a.add(&b)?;
    assert_eq!(c.dims(), &[2, 3]);
    assert_vec_approx(&c.to_f64_vec()?, &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0], 1e-12);
    Ok(())
}

#[test]
fn test_dtype_mismatch_rejected() -> Result<()> {
    let a = t(&[1.0], &[1])?;
    let b = CpuTensor::ones(1, DType::F32, &CpuDevice)?;
    assert!(a.add(&b).is_err());
    Ok(())
}

#[test]
fn test_reductions_over_dims() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?;
    assert_vec_approx(&a.sum(0, false)?.to_f64_vec()?, &[5.0, 7.0, 9.0], 1e-12);
    assert_vec_approx(&a.mean(1, false)?.to_f64_vec()?, &[2.0, 5.0], 1e-12);
    assert_eq!(a.mean(1, true)?.dims(), &[2, 1]);
    assert_vec_approx(&a.max(1, false)?.to_f64_vec()?, &[3.0, 6.0], 1e-12);
    assert_eq!(a.argmax(1, false)?.to_f64_vec()?, vec![2.0, 2.0]);
    assert!(approx_eq(a.mean_all()?.to_scalar_f64()?, 3.5, 1e-12));
    Ok(())
}

#[test]
fn test_var_dims_matches_population_variance() -> Result<()> {
    let a = t(&[1.0, 3.0, 5.0, 7.0], &[2, 2])?;
    let v = a.var_dims(&[0, 1], false)?;
    assert!(approx_eq(v.to_scalar_f64()?, 5.0, 1e-12));
    Ok(())
}

#[test]
fn test_log_softmax_normalizes() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, -1.0, 0.0, 100.0], &[2, 3])?;
    let p = a.log_softmax(1)?.exp()?.sum(1, false)?;
    assert_vec_approx(&p.to_f64_vec()?, &[1.0, 1.0], 1e-12);
    Ok(())
}

#[test]
fn test_matmul_values() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?;
    let b = t(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2])?;
    let c = a.matmul(&b)?;
    assert_vec_approx(&c.to_f64_vec()?, &[58.0, 64.0, 139.0, 154.0], 1e-12);
    // transposed view as rhs
    let ct = a.matmul(&a.t()?)?;
    assert_vec_approx(&ct.to_f64_vec()?, &[14.0, 32.0, 32.0, 77.0], 1e-12);
    Ok(())
}

#[test]
fn test_matmul_inner_dim_mismatch() -> Result<()> {
    let a = t(&[0.0; 6], &[2, 3])?;
    let b = t(&[0.0; 4], &[2, 2])?;
    assert!(a.matmul(&b).is_err());
    Ok(())
}

// Image kernels

/// Direct (loop) convolution used as the reference.
fn conv_reference(
    x: &[f64],
    [n, c, h, w]: [usize; 4],
    wt: &[f64],
    [co, _, kh, kw]: [usize; 4],
    stride: usize,
    pad: usize,
) -> Vec<f64> {
    let ho = (h + 2 * pad - kh) / stride + 1;
    let wo = (w + 2 * pad - kw) / stride + 1;
    let mut out = vec![0.0; n * co * ho * wo];
    for ni in 0..n {
        for o in 0..co {
            for y in 0..ho {
                for z in 0..wo {
                    let mut acc = 0.0;
                    for ci in 0..c {
                        for i in 0..kh {
                            for j in 0..kw {
                                let iy = (y * stride + i) as isize - pad as isize;
                                let iz = (z * stride + j) as isize - pad as isize;
                                if iy < 0 || iz < 0 || iy >= h as isize || iz >= w as isize {
                                    continue;
                                }
                                acc += x[((ni * c + ci) * h + iy as usize) * w + iz as usize]
                                    * wt[((o * c + ci) * kh + i) * kw + j];
                            }
                        }
                    }
                    out[((ni * co + o) * ho + y) * wo + z] = acc;
                }
            }
        }
    }
    out
}

#[test]
fn test_conv2d_matches_direct_convolution() -> Result<()> {
    let xd = pseudo(2 * 3 * 5 * 5, 1);
    let wd = pseudo(4 * 3 * 3 * 3, 2);
    let x = t(&xd, &[2, 3, 5, 5])?;
    let w = t(&wd, &[4, 3, 3, 3])?;
    let y = x.conv2d(&w, None, [2, 2], [1, 1])?;
    assert_eq!(y.dims(), &[2, 4, 3, 3]);
    let expected = conv_reference(&xd, [2, 3, 5, 5], &wd, [4, 3, 3, 3], 2, 1);
    assert_vec_approx(&y.to_f64_vec()?, &expected, 1e-10);
    Ok(())
}

#[test]
fn test_conv2d_bias_broadcasts_per_channel() -> Result<()> {
    let x = CpuTensor::zeros((1, 1, 3, 3), DType::F64, &CpuDevice)?;
    let w = CpuTensor::ones((2, 1, 1, 1), DType::F64, &CpuDevice)?;
    let b = t(&[0.5, -1.0], &[2])?;
    let y = x.conv2d(&w, Some(&b), [1, 1], [0, 0])?;
    let v = y.to_f64_vec()?;
    assert!(v[..9].iter().all(|&e| e == 0.5));
    assert!(v[9..].iter().all(|&e| e == -1.0));
    Ok(())
}

#[test]
fn test_conv2d_channel_mismatch() -> Result<()> {
    let x = CpuTensor::zeros((1, 2, 4, 4), DType::F64, &CpuDevice)?;
    let w = CpuTensor::zeros((1, 3, 3, 3), DType::F64, &CpuDevice)?;
    assert!(matches!(
        x.conv2d(&w, None, [1, 1], [0, 0]),
        Err(Error::ChannelMismatch { input: 2, weight: 3 })
    ));
    Ok(())
}

#[test]
fn test_unfold_fold_are_adjoint() -> Result<()> {
    let window = Window::square(3, 2, 1);
    let x = t(&pseudo(2 * 2 * 5 * 4, 3), &[2, 2, 5, 4])?;
    let cols = x.unfold(window)?;
    let y = t(&pseudo(cols.elem_count(), 4), cols.dims())?;
    let lhs = dot(&cols.to_f64_vec()?, &y.to_f64_vec()?);
    let rhs = dot(&x.to_f64_vec()?, &y.fold(window, [2, 2, 5, 4])?.to_f64_vec()?);
    assert!(approx_eq(lhs, rhs, 1e-10));
    Ok(())
}

#[test]
fn test_max_pool2d_values_and_gradient_routing() -> Result<()> {
    #[rustfmt::skip]
    let x = var(&[
        1.0, 2.0, 5.0, 0.0,
        3.0, 4.0, 1.0, 2.0,
        0.0, 0.0, 9.0, 8.0,
        7.0, 1.0, 6.0, 0.0,
    ], &[1, 1, 4, 4])?;
    let y = x.max_pool2d(Window::square(2, 2, 0))?;
    assert_eq!(y.dims(), &[1, 1, 2, 2]);
    assert_vec_approx(&y.to_f64_vec()?, &[4.0, 5.0, 7.0, 9.0], 1e-12);

    let grads = y.sum_all()?.backward()?;
    let gx = grads.get(&x).expect("grad for x").to_f64_vec()?;
    #[rustfmt::skip]
    let expected = [
        0.0, 0.0, 1.0, 0.0,
        0.0, 1.0, 0.0, 0.0,
        0.0, 0.0, 1.0, 0.0,
        1.0, 0.0, 0.0, 0.0,
    ];
    assert_vec_approx(&gx, &expected, 1e-12);
    Ok(())
}

#[test]
fn test_max_pool2d_padding_never_wins() -> Result<()> {
    let x = t(&[-1.0, -2.0, -3.0, -4.0], &[1, 1, 2, 2])?;
    let y = x.max_pool2d(Window::square(3, 2, 1))?;
    assert_vec_approx(&y.to_f64_vec()?, &[-1.0], 1e-12);
    Ok(())
}

#[test]
fn test_avg_pool2d_counts_padding() -> Result<()> {
    let x = CpuTensor::ones((1, 1, 2, 2), DType::F64, &CpuDevice)?;
    let plain = x.avg_pool2d(Window::square(2, 1, 0))?;
    assert_vec_approx(&plain.to_f64_vec()?, &[1.0], 1e-12);
    // 3x3 window with pad 1 sees four ones and five zeros
    let padded = x.avg_pool2d(Window::square(3, 2, 1))?;
    assert_vec_approx(&padded.to_f64_vec()?, &[4.0 / 9.0], 1e-12);
    Ok(())
}

#[test]
fn test_reshape_and_gather_report_counts() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?;
    assert!(matches!(
        a.reshape((4, 2)),
        Err(Error::ElementCountMismatch { op: "reshape", expected: 8, got: 6, .. })
    ));
    assert!(matches!(
        a.take_flat(Arc::new(vec![0, 6]), vec![2]),
        Err(Error::IndexOutOfRange { op: "take_flat", index: 6, len: 6 })
    ));
    Ok(())
}

#[test]
fn test_index_rows() -> Result<()> {
    let a = var(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2])?;
    let picked = a.index_rows(&[2, 0, 2])?;
    assert_eq!(picked.dims(), &[3, 2]);
    assert_vec_approx(&picked.to_f64_vec()?, &[5.0, 6.0, 1.0, 2.0, 5.0, 6.0], 1e-12);
    let g = picked.sum_all()?.backward()?;
    assert_vec_approx(
        &g.get(&a).expect("grad").to_f64_vec()?,
        &[1.0, 1.0, 0.0, 0.0, 2.0, 2.0],
        1e-12,
    );
    assert!(matches!(
        a.index_rows(&[3]),
        Err(Error::IndexOutOfRange { op: "index_rows", index: 3, len: 3 })
    ));
    Ok(())
}

// First-order gradients

#[test]
fn test_conv_pool_gradient_matches_finite_differences() -> Result<()> {
    let xd = pseudo(2 * 2 * 6 * 6, 5);
    let wd = pseudo(3 * 2 * 3 * 3, 6);
    let bd = pseudo(3, 7);
    let x = t(&xd, &[2, 2, 6, 6])?;
    let b = t(&bd, &[3])?;

    let loss_at = |w: &CpuTensor| -> Result<CpuTensor> {
        x.conv2d(w, Some(&b), [1, 1], [1, 1])?
            .relu()?
            .max_pool2d(Window::square(2, 2, 0))?
            .avg_pool2d(Window::square(3, 1, 0))?
            .square()?
            .sum_all()
    };

    let w = var(&wd, &[3, 2, 3, 3])?;
    let grads = loss_at(&w)?.backward()?;
    let analytic = grads.get(&w).expect("grad for w").to_f64_vec()?;
    let numeric = numeric_grad(&wd, |p| loss_at(&t(p, &[3, 2, 3, 3])?)?.to_scalar_f64())?;
    assert_vec_approx(&analytic, &numeric, 1e-5);
    Ok(())
}

#[test]
fn test_softmax_cross_entropy_gradient() -> Result<()> {
    let logits = var(&[0.2, -1.0, 3.0, 0.5, 0.5, 0.1], &[2, 3])?;
    let target = t(&[0.0, 0.0, 1.0, 1.0, 0.0, 0.0], &[2, 3])?;
    let loss = logits.log_softmax(1)?.mul(&target)?.sum_all()?.scale(-0.5)?;
    let g = loss.backward()?;
    let p = logits.softmax(1)?.to_f64_vec()?;
    let tv = target.to_f64_vec()?;
    let expected: Vec<f64> = p.iter().zip(&tv).map(|(p, t)| (p - t) / 2.0).collect();
    assert_vec_approx(&g.get(&logits).expect("grad").to_f64_vec()?, &expected, 1e-10);
    Ok(())
}

#[test]
fn test_backward_skips_constants() -> Result<()> {
    let x = t(&[1.0, 2.0], &[2])?;
    let w = var(&[3.0, 4.0], &[2])?;
    let g = x.mul(&w)?.sum_all()?.backward()?;
    assert!(g.get(&x).is_none());
    assert_vec_approx(&g.get(&w).expect("grad").to_f64_vec()?, &[1.0, 2.0], 1e-12);
    Ok(())
}

#[test]
fn test_backward_requires_scalar() -> Result<()> {
    let w = var(&[3.0, 4.0], &[2])?;
    assert!(matches!(
        w.square()?.backward(),
        Err(Error::NotAScalar { op: "backward", .. })
    ));
    Ok(())
}

// Second-order gradients

#[test]
fn test_gradient_of_gradient_cubic() -> Result<()> {
    // L = sum(w³), dL/dw = 3w², d(sum(dL/dw))/dw = 6w
    let w = var(&[1.0, -2.0, 0.5], &[3])?;
    let loss = w.mul(&w)?.mul(&w)?.sum_all()?;
    let g = loss.backward()?.get(&w).expect("grad").clone();
    assert_vec_approx(&g.to_f64_vec()?, &[3.0, 12.0, 0.75], 1e-12);
    let gg = g.sum_all()?.backward()?;
    assert_vec_approx(&gg.get(&w).expect("grad").to_f64_vec()?, &[6.0, -12.0, 3.0], 1e-12);
    Ok(())
}

#[test]
fn test_gradient_of_gradient_through_reductions() -> Result<()> {
    // L = mean(w)² * 4 over 2 elements, dL/dw_i = 4 * mean(w), sum → 8 mean(w)
    let w = var(&[1.0, 3.0], &[2])?;
    let loss = w.mean_all()?.square()?.scale(4.0)?;
    let g = loss.backward()?.get(&w).expect("grad").clone();
    assert_vec_approx(&g.to_f64_vec()?, &[8.0, 8.0], 1e-12);
    let gg = g.sum_all()?.backward()?;
    // d(8 * mean(w))/dw_i = 4
    assert_vec_approx(&gg.get(&w).expect("grad").to_f64_vec()?, &[4.0, 4.0], 1e-12);
    Ok(())
}

#[test]
fn test_hessian_vector_product_through_conv_and_pool() -> Result<()> {
    // L(w) = sum(avgpool(conv(x, w))²) is quadratic in w, so the gradient is
    // linear and (g(w + v) - g(w)) equals the Hessian-vector product exactly.
    let xd = pseudo(1 * 2 * 5 * 5, 11);
    let wd = pseudo(2 * 2 * 3 * 3, 12);
    let vd = pseudo(2 * 2 * 3 * 3, 13);
    let x = t(&xd, &[1, 2, 5, 5])?;
    let shape = [2usize, 2, 3, 3];

    let grad_at = |wv: &[f64]| -> Result<(CpuTensor, CpuTensor)> {
        let w = var(wv, &shape)?;
        let loss = x
            .conv2d(&w, None, [1, 1], [1, 1])?
            .avg_pool2d(Window::square(2, 1, 0))?
            .square()?
            .sum_all()?;
        let g = loss.backward()?.get(&w).expect("grad").clone();
        Ok((w, g))
    };

    let (w, g) = grad_at(&wd)?;
    let v = t(&vd, &shape)?;
    let hv = g.mul(&v)?.sum_all()?.backward()?;
    let hv = hv.get(&w).expect("hvp").to_f64_vec()?;

    let shifted: Vec<f64> = wd.iter().zip(&vd).map(|(a, b)| a + b).collect();
    let (_, g2) = grad_at(&shifted)?;
    let expected: Vec<f64> = g2
        .to_f64_vec()?
        .iter()
        .zip(g.to_f64_vec()?)
        .map(|(a, b)| a - b)
        .collect();
    assert_vec_approx(&hv, &expected, 1e-9);
    Ok(())
}

#[test]
fn test_take_scatter_second_order() -> Result<()> {
    let w = var(&[1.0, 2.0, 3.0], &[3])?;
    let picked = w.take_flat(Arc::new(vec![2, 2, 0]), 3)?;
    let loss = picked.square()?.sum_all()?;
    let g = loss.backward()?.get(&w).expect("grad").clone();
    // d/dw0 = 2*1, d/dw1 = 0, d/dw2 = 2*(2*3)
    assert_vec_approx(&g.to_f64_vec()?, &[2.0, 0.0, 12.0], 1e-12);
    let gg = g.sum_all()?.backward()?;
    assert_vec_approx(&gg.get(&w).expect("grad").to_f64_vec()?, &[2.0, 0.0, 4.0], 1e-12);
    Ok(())
}

// Storage semantics

#[test]
fn test_inplace_update_visible_through_clones_not_copies() -> Result<()> {
    let a = var(&[1.0, 2.0], &[2])?;
    let alias = a.clone();
    let detached = a.detach();
    let copy = a.copy_detached()?;
    a.update_data_inplace(&[5.0, 6.0])?;
    assert_eq!(alias.to_f64_vec()?, vec![5.0, 6.0]);
    assert_eq!(detached.to_f64_vec()?, vec![5.0, 6.0]);
    assert_eq!(copy.to_f64_vec()?, vec![1.0, 2.0]);
    assert!(a.shares_storage_with(&detached));
    assert!(!a.shares_storage_with(&copy));
    assert!(matches!(
        a.update_data_inplace(&[1.0]),
        Err(Error::ElementCountMismatch { op: "update_data_inplace", got: 1, .. })
    ));
    Ok(())
}

#[test]
fn test_f32_tensors_roundtrip() -> Result<()> {
    let a = Tensor::<CpuBackend>::from_f64_slice(&[0.5, 1.5], 2, DType::F32, &CpuDevice)?;
    let b = a.scale(2.0)?;
    assert_eq!(b.dtype(), DType::F32);
    assert_vec_approx(&b.to_f64_vec()?, &[1.0, 3.0], 1e-6);
    Ok(())
}
