use std::sync::{Arc, RwLock};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId, Window};
use crate::shape::Shape;

// Tensor — n-dimensional array with a recorded computation graph
//
// MEMORY MODEL:
//
//   Tensor is a cheap handle around Arc<TensorInner>. The storage itself is
//   behind Arc<RwLock<..>> so views (transpose, reshape of contiguous data,
//   detach) share one buffer, and optimizers / batch-norm running
//   statistics can overwrite a buffer in place with `update_data_inplace`.
//
// GRAPH:
//
//   Every computed tensor records the Op that produced it. `backward()`
//   walks that graph. Because each gradient rule is expressed with the same
//   tensor methods defined here, the gradients are graph nodes too and a
//   loss computed from them can be differentiated again. This is what the
//   meta-learning inner loop relies on.
//
// IMAGE KERNELS:
//
//   conv2d, max_pool2d and avg_pool2d are not primitives. They are built from
//   unfold (im2col), matmul, reductions and a flat index gather, each of which
//   has an adjoint op with its own gradient rule.

/// Inner data of a tensor, shared via Arc.
struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    /// How this tensor was produced. Op::None for leaves.
    op: Op<B>,
    /// Marks trainable parameters.
    is_variable: bool,
}

/// An n-dimensional array of numbers on a specific backend.
///
/// # Example
/// ```ignore
/// use fsl_core::{DType, Tensor};
/// use fsl_cpu::{CpuBackend, CpuDevice};
///
/// let a = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &CpuDevice)?;
/// let b = Tensor::<CpuBackend>::ones((2, 2), DType::F64, &CpuDevice)?;
/// let c = a.add(&b)?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// Contiguous tensor of `shape` built from host data, recording `op`.
    fn from_host(data: &[f64], shape: Shape, dtype: DType, device: &B::Device, op: Op<B>) -> Result<Self> {
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                op: "from_host",
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            op,
        ))
    }

    /// A view sharing this tensor's storage under a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    /// Whether `other` reads from the same storage buffer as `self`.
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // In-place mutation

    /// Overwrite the underlying storage with `new_data`.
    ///
    /// Every tensor sharing this storage observes the new values. Optimizers
    /// use this to update parameters, batch-norm uses it to refresh running
    /// statistics. The element count must match; the shape is unchanged.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::ElementCountMismatch {
                op: "update_data_inplace",
                shape: self.shape().clone(),
                expected,
                got: new_data.len(),
            });
        }
        if !self.is_contiguous() {
            return Err(Error::msg(
                "update_data_inplace: tensor is a strided view, write to the base tensor",
            ));
        }
        let new_storage = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        let mut guard = self.write_storage()?;
        *guard = new_storage;
        Ok(())
    }

    // Creation methods

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Leaf tensor from a flat slice of f64 values, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Self::from_host(data, shape.into(), dtype, device, Op::None)
    }

    /// Uniform samples in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Standard normal samples.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone(), other.dtype(), other.device())
    }

    pub fn full_like(other: &Self, val: f64) -> Result<Self> {
        Self::full(other.shape().clone(), val, other.dtype(), other.device())
    }

    /// Mark this tensor as a trainable variable. Keeps id and storage.
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: true,
            }),
        }
    }

    // Shape manipulation

    /// Swap two dimensions (no data copy).
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Transpose of a matrix.
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Reshape to a shape with the same element count. Non-contiguous
    /// tensors are copied to contiguous storage first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ElementCountMismatch {
                op: "reshape",
                expected: new_count,
                got: current_count,
                shape: new_shape,
            });
        }
        let tensor = self.contiguous()?;
        let src_shape = tensor.shape().clone();
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape,
        };
        Ok(tensor.view_with_layout(Layout::contiguous(new_shape), op))
    }

    /// Contiguous version of this tensor (an Arc copy when already contiguous).
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::to_contiguous(&storage, &self.inner.layout)?;
        Ok(Self::from_storage(
            new_storage,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    /// Insert a size-1 dimension at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let mut dims = self.dims().to_vec();
        dims.insert(dim, 1);
        self.reshape(dims)
    }

    /// Flatten dimensions `start_dim..=end_dim` into one.
    pub fn flatten(&self, start_dim: usize, end_dim: usize) -> Result<Self> {
        let rank = self.rank();
        if start_dim >= rank || end_dim >= rank || start_dim > end_dim {
            return Err(Error::msg(format!(
                "flatten: invalid range [{}, {}] for rank {}",
                start_dim, end_dim, rank
            )));
        }
        let dims = self.dims();
        let mut new_dims: Vec<usize> = dims[..start_dim].to_vec();
        new_dims.push(dims[start_dim..=end_dim].iter().product());
        new_dims.extend_from_slice(&dims[end_dim + 1..]);
        self.reshape(new_dims)
    }

    // Arithmetic operations

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let result_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::binary_op(
            op,
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;
        let result_op = Op::Binary {
            lhs: self.clone(),
            rhs: rhs.clone(),
            op,
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Unary operations

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::unary_op(op, &storage, &self.inner.layout)?;
        let result_op = Op::Unary {
            input: self.clone(),
            op,
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    /// result[i] = self[i] * mul + add
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::affine(&storage, &self.inner.layout, mul, add)?;
        let result_op = Op::Affine {
            input: self.clone(),
            mul,
            add,
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    /// Multiply every element by a constant.
    pub fn scale(&self, factor: f64) -> Result<Self> {
        self.affine(factor, 0.0)
    }

    // Reductions

    /// Sum of all elements as a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    pub fn sum_dims(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, dims, keep_dim)
    }

    /// Mean of all elements as a scalar tensor.
    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[dim], keep_dim)
    }

    pub fn mean_dims(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, dims, keep_dim)
    }

    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, &[dim], keep_dim)
    }

    /// Index of the maximum along `dim` (I64, not differentiable).
    pub fn argmax(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::ArgMax, &[dim], keep_dim)
    }

    fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        if op == ReduceOp::ArgMax && dims.len() != 1 {
            return Err(Error::msg("argmax reduces exactly one dimension"));
        }
        let storage = self.read_storage()?;
        let result = B::reduce_op(op, &storage, &self.inner.layout, dims, keep_dim)?;

        let result_shape = reduced_shape(self.shape(), dims, keep_dim);
        let result_dtype = match op {
            ReduceOp::ArgMax => DType::I64,
            _ => self.inner.dtype,
        };
        let result_op = Op::Reduce {
            input: self.clone(),
            op,
            dims: dims.to_vec(),
            keep_dim,
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(result_shape),
            result_dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Composite operations

    /// Numerically stable softmax along `dim`. The max is detached.
    pub fn softmax(&self, dim: usize) -> Result<Self> {
        let max_detached = self.max(dim, true)?.detach();
        let exp_x = self.sub(&max_detached)?.exp()?;
        let sum_exp = exp_x.sum(dim, true)?;
        exp_x.div(&sum_exp)
    }

    /// log_softmax(x)_i = x_i - max(x) - log(sum(exp(x - max(x))))
    pub fn log_softmax(&self, dim: usize) -> Result<Self> {
        let max_val = self.max(dim, true)?.detach();
        let shifted = self.sub(&max_val)?;
        let log_sum_exp = shifted.exp()?.sum(dim, true)?.log()?;
        shifted.sub(&log_sum_exp)
    }

    /// Biased variance over `dims`: mean((x - mean(x))²).
    pub fn var_dims(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        let mu = self.mean_dims(dims, true)?;
        self.sub(&mu)?.square()?.mean_dims(dims, keep_dim)
    }

    /// Matrix multiplication over the last two dimensions.
    ///
    /// - [m, k] @ [k, n] → [m, n]
    /// - Batched: [b, m, k] @ [b, k, n] → [b, m, n]
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        if self.rank() < 2 || rhs.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let lhs_dims = self.dims();
        let rhs_dims = rhs.dims();
        let m = lhs_dims[lhs_dims.len() - 2];
        let k1 = lhs_dims[lhs_dims.len() - 1];
        let k2 = rhs_dims[rhs_dims.len() - 2];
        let n = rhs_dims[rhs_dims.len() - 1];
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        if lhs_dims[..lhs_dims.len() - 2] != rhs_dims[..rhs_dims.len() - 2] {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: rhs.shape().clone(),
            });
        }

        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::matmul(
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;

        let mut result_dims: Vec<usize> = lhs_dims[..lhs_dims.len() - 2].to_vec();
        result_dims.push(m);
        result_dims.push(n);
        let result_op = Op::Matmul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(Shape::new(result_dims)),
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Image kernels

    /// im2col over a batch: `[N, C, H, W]` → `[C*kh*kw, N*H_out*W_out]`.
    ///
    /// Row `(c*kh + i)*kw + j` holds, for every output position, the input
    /// value under kernel tap (i, j) of channel c (zero in the padding).
    pub fn unfold(&self, window: Window) -> Result<Self> {
        let [n, c, h, w] = image_dims(self)?;
        let [h_out, w_out] = window.output_size([h, w]).ok_or(Error::WindowTooLarge {
            kernel: window.kernel,
            padding: window.padding,
            input: [h, w],
        })?;
        let data = self.to_f64_vec()?;
        let rows = c * window.kernel[0] * window.kernel[1];
        let cols = n * h_out * w_out;
        let mut out = vec![0.0f64; rows * cols];
        im2col(&data, [n, c, h, w], window, [h_out, w_out], &mut out);
        Self::from_host(
            &out,
            Shape::new(vec![rows, cols]),
            self.dtype(),
            self.device(),
            Op::Unfold {
                input: self.clone(),
                window,
            },
        )
    }

    /// col2im, the adjoint of `unfold`: scatters columns back into an image
    /// of `image_dims` = [N, C, H, W], summing overlapping taps.
    pub fn fold(&self, window: Window, image_dims: [usize; 4]) -> Result<Self> {
        let [n, c, h, w] = image_dims;
        let [h_out, w_out] = window.output_size([h, w]).ok_or(Error::WindowTooLarge {
            kernel: window.kernel,
            padding: window.padding,
            input: [h, w],
        })?;
        let expected = Shape::new(vec![
            c * window.kernel[0] * window.kernel[1],
            n * h_out * w_out,
        ]);
        if self.shape() != &expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: self.shape().clone(),
            });
        }
        let cols = self.to_f64_vec()?;
        let mut out = vec![0.0f64; n * c * h * w];
        col2im(&cols, image_dims, window, [h_out, w_out], &mut out);
        Self::from_host(
            &out,
            Shape::new(image_dims.to_vec()),
            self.dtype(),
            self.device(),
            Op::Fold {
                input: self.clone(),
                window,
                image_dims,
            },
        )
    }

    /// Gather by logical flat index: `out[i] = self.flatten()[indices[i]]`,
    /// returned with `shape`.
    pub fn take_flat(&self, indices: Arc<Vec<usize>>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != indices.len() {
            return Err(Error::ElementCountMismatch {
                op: "take_flat",
                expected: shape.elem_count(),
                got: indices.len(),
                shape,
            });
        }
        let data = self.to_f64_vec()?;
        let mut out = Vec::with_capacity(indices.len());
        for &i in indices.iter() {
            match data.get(i) {
                Some(&v) => out.push(v),
                None => {
                    return Err(Error::IndexOutOfRange {
                        op: "take_flat",
                        index: i,
                        len: data.len(),
                    })
                }
            }
        }
        Self::from_host(
            &out,
            shape,
            self.dtype(),
            self.device(),
            Op::TakeFlat {
                input: self.clone(),
                indices,
            },
        )
    }

    /// Scatter-add by logical flat index into zeros of `out_shape`, the
    /// adjoint of `take_flat`.
    pub fn scatter_flat(&self, indices: Arc<Vec<usize>>, out_shape: impl Into<Shape>) -> Result<Self> {
        let out_shape = out_shape.into();
        if self.elem_count() != indices.len() {
            return Err(Error::ElementCountMismatch {
                op: "scatter_flat",
                shape: self.shape().clone(),
                expected: self.elem_count(),
                got: indices.len(),
            });
        }
        let data = self.to_f64_vec()?;
        let mut out = vec![0.0f64; out_shape.elem_count()];
        for (&i, &v) in indices.iter().zip(data.iter()) {
            match out.get_mut(i) {
                Some(slot) => *slot += v,
                None => {
                    return Err(Error::IndexOutOfRange {
                        op: "scatter_flat",
                        index: i,
                        len: out_shape.elem_count(),
                    })
                }
            }
        }
        Self::from_host(
            &out,
            out_shape.clone(),
            self.dtype(),
            self.device(),
            Op::ScatterFlat {
                input: self.clone(),
                indices,
                out_shape,
            },
        )
    }

    /// Rows of dimension 0 picked by `rows` (repeats allowed). Differentiable.
    pub fn index_rows(&self, rows: &[usize]) -> Result<Self> {
        if self.rank() == 0 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            });
        }
        let n = self.dims()[0];
        let row_len: usize = self.dims()[1..].iter().product();
        let mut indices = Vec::with_capacity(rows.len() * row_len);
        for &r in rows {
            if r >= n {
                return Err(Error::IndexOutOfRange {
                    op: "index_rows",
                    index: r,
                    len: n,
                });
            }
            indices.extend(r * row_len..(r + 1) * row_len);
        }
        let mut dims = self.dims().to_vec();
        dims[0] = rows.len();
        self.take_flat(Arc::new(indices), dims)
    }

    /// 2-D convolution.
    ///
    /// - `self`:   `[N, C_in, H, W]`
    /// - `weight`: `[C_out, C_in, kH, kW]`
    /// - `bias`:   optional `[C_out]`
    ///
    /// Computed as `weight.reshape([C_out, C_in*kH*kW]) @ unfold(self)`, so the
    /// result is differentiable to any order in input, weight and bias.
    pub fn conv2d(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        let [n, c_in, h, w] = image_dims(self)?;
        if weight.rank() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: weight.rank(),
            });
        }
        let w_dims = weight.dims();
        let (c_out, wc_in, kh, kw) = (w_dims[0], w_dims[1], w_dims[2], w_dims[3]);
        if c_in != wc_in {
            return Err(Error::ChannelMismatch {
                input: c_in,
                weight: wc_in,
            });
        }
        let window = Window::new([kh, kw], stride, padding);
        let [h_out, w_out] = window.output_size([h, w]).ok_or(Error::WindowTooLarge {
            kernel: window.kernel,
            padding,
            input: [h, w],
        })?;

        let cols = self.unfold(window)?;
        let w2 = weight.reshape(vec![c_out, c_in * kh * kw])?;
        let out = w2
            .matmul(&cols)?
            .reshape(vec![c_out, n, h_out * w_out])?
            .transpose(0, 1)?
            .reshape(vec![n, c_out, h_out, w_out])?;
        match bias {
            Some(b) => {
                if b.dims() != [c_out] {
                    return Err(Error::ShapeMismatch {
                        expected: Shape::from(c_out),
                        got: b.shape().clone(),
                    });
                }
                out.add(&b.reshape(vec![c_out, 1, 1])?)
            }
            None => Ok(out),
        }
    }

    /// 2-D max pooling over `[N, C, H, W]`. Padded cells never win.
    ///
    /// The winning positions are found on host data and the result is a
    /// flat gather of them, so the gradient routes to the argmax cells.
    pub fn max_pool2d(&self, window: Window) -> Result<Self> {
        let [n, c, h, w] = image_dims(self)?;
        let [h_out, w_out] = window.output_size([h, w]).ok_or(Error::WindowTooLarge {
            kernel: window.kernel,
            padding: window.padding,
            input: [h, w],
        })?;
        let data = self.to_f64_vec()?;
        let [kh, kw] = window.kernel;
        let [sh, sw] = window.stride;
        let [ph, pw] = window.padding;
        let mut indices = Vec::with_capacity(n * c * h_out * w_out);
        for plane in 0..n * c {
            let base = plane * h * w;
            for oh in 0..h_out {
                for ow in 0..w_out {
                    let mut best: Option<(usize, f64)> = None;
                    for ki in 0..kh {
                        let ih = (oh * sh + ki) as isize - ph as isize;
                        if ih < 0 || ih >= h as isize {
                            continue;
                        }
                        for kj in 0..kw {
                            let iw = (ow * sw + kj) as isize - pw as isize;
                            if iw < 0 || iw >= w as isize {
                                continue;
                            }
                            let idx = base + ih as usize * w + iw as usize;
                            let v = data[idx];
                            if best.map_or(true, |(_, bv)| v > bv) {
                                best = Some((idx, v));
                            }
                        }
                    }
                    match best {
                        Some((idx, _)) => indices.push(idx),
                        None => {
                            return Err(Error::msg(
                                "max_pool2d: a pooling window lies entirely in the padding",
                            ))
                        }
                    }
                }
            }
        }
        self.take_flat(Arc::new(indices), vec![n, c, h_out, w_out])
    }

    /// 2-D average pooling over `[N, C, H, W]`. Zero padding counts toward
    /// the divisor (every window averages kh*kw cells).
    pub fn avg_pool2d(&self, window: Window) -> Result<Self> {
        let [n, c, h, w] = image_dims(self)?;
        let [h_out, w_out] = window.output_size([h, w]).ok_or(Error::WindowTooLarge {
            kernel: window.kernel,
            padding: window.padding,
            input: [h, w],
        })?;
        let taps = window.kernel[0] * window.kernel[1];
        self.unfold(window)?
            .reshape(vec![c, taps, n * h_out * w_out])?
            .mean(1, false)?
            .reshape(vec![c, n, h_out * w_out])?
            .transpose(0, 1)?
            .reshape(vec![n, c, h_out, w_out])
    }

    // Data extraction

    /// All elements in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                op: "to_scalar_f64",
                shape: self.shape().clone(),
            });
        }
        let vec = self.to_f64_vec()?;
        Ok(vec[0])
    }

    /// True when no element is NaN or infinite.
    pub fn all_finite(&self) -> Result<bool> {
        Ok(self.to_f64_vec()?.iter().all(|v| v.is_finite()))
    }

    // Autograd

    /// Reverse-mode gradients of this scalar with respect to every tensor in
    /// its graph. The returned gradients carry their own graph.
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }

    /// Same data, no graph: Op::None and a fresh id. Shares storage.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }

    /// Independent leaf copy: new storage, new id, no graph.
    pub fn copy_detached(&self) -> Result<Self> {
        let data = self.to_f64_vec()?;
        Self::from_f64_slice(&data, self.shape().clone(), self.dtype(), self.device())
    }
}

/// Output shape of a reduction over `dims` (all dims when empty).
pub(crate) fn reduced_shape(shape: &Shape, dims: &[usize], keep_dim: bool) -> Shape {
    if dims.is_empty() {
        return if keep_dim {
            Shape::new(vec![1; shape.rank()])
        } else {
            Shape::from(())
        };
    }
    if keep_dim {
        shape.with_reduced(dims)
    } else {
        Shape::new(
            shape
                .dims()
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, &d)| d)
                .collect(),
        )
    }
}

fn image_dims<B: Backend>(t: &Tensor<B>) -> Result<[usize; 4]> {
    match t.dims() {
        &[n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(Error::RankMismatch {
            expected: 4,
            got: t.rank(),
        }),
    }
}

// im2col / col2im helpers (host f64 buffers)

/// Visit every (column-buffer index, image index) pair of a batched im2col.
/// Taps that land in the padding are skipped.
fn for_each_tap(
    dims: [usize; 4],
    window: Window,
    out_size: [usize; 2],
    mut f: impl FnMut(usize, usize),
) {
    let [n, c, h, w] = dims;
    let [kh, kw] = window.kernel;
    let [sh, sw] = window.stride;
    let [ph, pw] = window.padding;
    let [h_out, w_out] = out_size;
    let cols = n * h_out * w_out;
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                for ni in 0..n {
                    for oh in 0..h_out {
                        let ih = (oh * sh + ki) as isize - ph as isize;
                        if ih < 0 || ih >= h as isize {
                            continue;
                        }
                        for ow in 0..w_out {
                            let iw = (ow * sw + kj) as isize - pw as isize;
                            if iw < 0 || iw >= w as isize {
                                continue;
                            }
                            let col = (ni * h_out + oh) * w_out + ow;
                            let img = ((ni * c + ci) * h + ih as usize) * w + iw as usize;
                            f(row * cols + col, img);
                        }
                    }
                }
            }
        }
    }
}

fn im2col(input: &[f64], dims: [usize; 4], window: Window, out_size: [usize; 2], cols: &mut [f64]) {
    for_each_tap(dims, window, out_size, |col_idx, img_idx| {
        cols[col_idx] = input[img_idx];
    });
}

fn col2im(cols: &[f64], dims: [usize; 4], window: Window, out_size: [usize; 2], image: &mut [f64]) {
    for_each_tap(dims, window, out_size, |col_idx, img_idx| {
        image[img_idx] += cols[col_idx];
    });
}
