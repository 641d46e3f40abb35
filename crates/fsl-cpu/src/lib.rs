//! # fsl-cpu
//!
//! CPU backend for fsl.
//!
//! - `CpuDevice` is a unit handle (there is one host)
//! - `CpuStorage` is an enum over `Vec<T>` for each supported dtype
//! - element-wise kernels walk strided layouts directly, so transposed and
//!   broadcast views are read without an intermediate copy
//! - matmul is parallelized over output rows with rayon; every output element
//!   is accumulated by exactly one thread in a fixed order, so results are
//!   bit-for-bit reproducible regardless of thread count

use std::fmt;

use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use fsl_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use fsl_core::dtype::DType;
use fsl_core::error::{Error, Result};
use fsl_core::layout::Layout;
use fsl_core::shape::Shape;

/// The host device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Host buffer, one variant per dtype.
#[derive(Clone)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl fmt::Debug for CpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuStorage({}, len={})", self.dtype(), self.len())
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

impl CpuStorage {
    /// Element at flat storage index `i`, widened to f64.
    fn get(&self, i: usize) -> f64 {
        match self {
            CpuStorage::F32(v) => v[i] as f64,
            CpuStorage::F64(v) => v[i],
            CpuStorage::I64(v) => v[i] as f64,
        }
    }

    fn from_f64_vec(data: Vec<f64>, dtype: DType) -> CpuStorage {
        match dtype {
            DType::F32 => CpuStorage::F32(data.into_iter().map(|x| x as f32).collect()),
            DType::F64 => CpuStorage::F64(data),
            DType::I64 => CpuStorage::I64(data.into_iter().map(|x| x as i64).collect()),
        }
    }

    /// Elements in logical order of `layout`.
    fn gather(&self, layout: &Layout) -> Result<Vec<f64>> {
        if layout.elem_count() > 0 {
            let last = layout.offset()
                + layout
                    .dims()
                    .iter()
                    .zip(layout.strides())
                    .map(|(&d, &s)| (d - 1) * s)
                    .sum::<usize>();
            if last >= self.len() {
                return Err(Error::msg(format!(
                    "layout addresses element {} of a storage with {} elements",
                    last,
                    self.len()
                )));
            }
        }
        if layout.is_contiguous() {
            if let CpuStorage::F64(v) = self {
                return Ok(v[..layout.elem_count()].to_vec());
            }
        }
        Ok(layout.strided_indices().map(|i| self.get(i)).collect())
    }
}

/// The CPU backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// Tensor on the CPU backend.
pub type CpuTensor = fsl_core::Tensor<CpuBackend>;

fn unary_fn(op: UnaryOp) -> fn(f64) -> f64 {
    match op {
        UnaryOp::Neg => |x| -x,
        UnaryOp::Exp => f64::exp,
        UnaryOp::Log => f64::ln,
        UnaryOp::Sqrt => f64::sqrt,
        UnaryOp::Square => |x| x * x,
        UnaryOp::Relu => |x| if x > 0.0 { x } else { 0.0 },
    }
}

fn binary_fn(op: BinaryOp) -> fn(f64, f64) -> f64 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
    }
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 0.0, dtype, device)
    }

    fn ones(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 1.0, dtype, device)
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(match dtype {
            DType::F32 => CpuStorage::F32(vec![val as f32; n]),
            DType::F64 => CpuStorage::F64(vec![val; n]),
            DType::I64 => CpuStorage::I64(vec![val as i64; n]),
        })
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(data.to_vec(), dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Ok(CpuStorage::from_f64_vec(data, dtype))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        Ok(CpuStorage::from_f64_vec(data, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let out_shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
        let l = lhs_layout.broadcast_as(&out_shape)?;
        let r = rhs_layout.broadcast_as(&out_shape)?;
        let f = binary_fn(op);
        let data: Vec<f64> = l
            .strided_indices()
            .zip(r.strided_indices())
            .map(|(i, j)| f(lhs.get(i), rhs.get(j)))
            .collect();
        Ok(CpuStorage::from_f64_vec(data, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let f = unary_fn(op);
        let data: Vec<f64> = input.gather(layout)?.into_iter().map(f).collect();
        Ok(CpuStorage::from_f64_vec(data, input.dtype()))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let data: Vec<f64> = input
            .gather(layout)?
            .into_iter()
            .map(|x| x * mul + add)
            .collect();
        Ok(CpuStorage::from_f64_vec(data, input.dtype()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        _keep_dim: bool,
    ) -> Result<CpuStorage> {
        let shape = layout.shape();
        let all: Vec<usize> = (0..shape.rank()).collect();
        let dims = if dims.is_empty() { &all[..] } else { dims };
        let keep = shape.with_reduced(dims);
        let out_len = keep.elem_count();
        // For each input element (logical order), the output slot it folds into.
        let owners = Layout::contiguous(keep).broadcast_as(shape)?;
        let values = input.gather(layout)?;

        match op {
            ReduceOp::Sum | ReduceOp::Mean => {
                let mut acc = vec![0.0f64; out_len];
                for (v, o) in values.iter().zip(owners.strided_indices()) {
                    acc[o] += v;
                }
                if op == ReduceOp::Mean {
                    let n = (values.len() / out_len.max(1)).max(1) as f64;
                    acc.iter_mut().for_each(|a| *a /= n);
                }
                Ok(CpuStorage::from_f64_vec(acc, input.dtype()))
            }
            ReduceOp::Max => {
                let mut acc = vec![f64::NEG_INFINITY; out_len];
                for (v, o) in values.iter().zip(owners.strided_indices()) {
                    if *v > acc[o] || v.is_nan() {
                        acc[o] = *v;
                    }
                }
                Ok(CpuStorage::from_f64_vec(acc, input.dtype()))
            }
            ReduceOp::ArgMax => {
                let d = dims[0];
                let inner: usize = shape.dims()[d + 1..].iter().product();
                let size = shape.dims()[d];
                let mut best = vec![f64::NEG_INFINITY; out_len];
                let mut arg = vec![0.0f64; out_len];
                for (i, (v, o)) in values.iter().zip(owners.strided_indices()).enumerate() {
                    let coord = (i / inner.max(1)) % size.max(1);
                    if *v > best[o] {
                        best[o] = *v;
                        arg[o] = coord as f64;
                    }
                }
                Ok(CpuStorage::from_f64_vec(arg, DType::I64))
            }
        }
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let ld = lhs_layout.dims();
        let rd = rhs_layout.dims();
        if ld.len() < 2 || rd.len() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: ld.len().min(rd.len()),
            });
        }
        let (m, k) = (ld[ld.len() - 2], ld[ld.len() - 1]);
        let n = rd[rd.len() - 1];
        let batch: usize = ld[..ld.len() - 2].iter().product();
        let a = lhs.gather(lhs_layout)?;
        let b = rhs.gather(rhs_layout)?;

        let mut out = vec![0.0f64; batch * m * n];
        if n > 0 {
            out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
                let bi = row / m.max(1);
                let a_row = &a[row * k..(row + 1) * k];
                let b_mat = &b[bi * k * n..(bi + 1) * k * n];
                for (p, &av) in a_row.iter().enumerate() {
                    let b_row = &b_mat[p * n..(p + 1) * n];
                    for (o, &bv) in out_row.iter_mut().zip(b_row.iter()) {
                        *o += av * bv;
                    }
                }
            });
        }
        Ok(CpuStorage::from_f64_vec(out, lhs.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_vec(input.gather(layout)?, input.dtype()))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        input.gather(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name() {
        assert_eq!(CpuDevice.name(), "cpu");
    }

    #[test]
    fn test_gather_transposed() {
        let s = CpuStorage::F64(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let layout = Layout::contiguous(Shape::from((2, 3))).transpose(0, 1).unwrap();
        assert_eq!(s.gather(&layout).unwrap(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_gather_rejects_out_of_range_layout() {
        let s = CpuStorage::F64(vec![0.0, 1.0]);
        let layout = Layout::contiguous(Shape::from(3));
        assert!(s.gather(&layout).is_err());
    }

    #[test]
    fn test_f32_storage_rounds() {
        let s = CpuStorage::from_f64_vec(vec![0.1], DType::F32);
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.get(0), 0.1f32 as f64);
    }
}
