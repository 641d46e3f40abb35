// Op — graph node recorded on every computed tensor
//
// Each variant keeps Arc handles to its inputs plus whatever the gradient
// rule needs (shapes, window geometry, gather indices). Gradient rules in
// `backprop` are themselves built from tensor ops, so the graph recorded
// while computing a gradient can be differentiated again.
//
// The image kernels come in adjoint pairs so that closure holds:
//   Unfold  <-> Fold         (im2col / col2im)
//   TakeFlat <-> ScatterFlat (index gather / scatter-add)

use std::sync::Arc;

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Next id from a global atomic counter.
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Sliding-window geometry shared by unfold, fold and the pooling kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Window {
    pub fn new(kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Self {
        Window {
            kernel,
            stride,
            padding,
        }
    }

    /// Square window with the same kernel/stride/padding on both axes.
    pub fn square(kernel: usize, stride: usize, padding: usize) -> Self {
        Self::new([kernel; 2], [stride; 2], [padding; 2])
    }

    /// Output spatial size for an input of `[h, w]`, or None when the kernel
    /// does not fit the padded input or the stride is zero.
    pub fn output_size(&self, input: [usize; 2]) -> Option<[usize; 2]> {
        let mut out = [0usize; 2];
        for a in 0..2 {
            let padded = input[a] + 2 * self.padding[a];
            if self.stride[a] == 0 || self.kernel[a] == 0 || padded < self.kernel[a] {
                return None;
            }
            out[a] = (padded - self.kernel[a]) / self.stride[a] + 1;
        }
        Some(out)
    }
}

/// The operation that produced a tensor.
pub enum Op<B: Backend> {
    /// Leaf: input data or a parameter.
    None,

    Binary {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
        op: BinaryOp,
    },

    Unary {
        input: Tensor<B>,
        op: UnaryOp,
    },

    Reduce {
        input: Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    Matmul {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
    },

    /// Same data, different shape. `src_shape` lets backward reshape back.
    Reshape {
        input: Tensor<B>,
        src_shape: Shape,
    },

    Transpose {
        input: Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    /// result = input * mul + add
    Affine {
        input: Tensor<B>,
        mul: f64,
        add: f64,
    },

    /// Contiguous copy; the gradient passes through unchanged.
    Contiguous { input: Tensor<B> },

    /// im2col: [N, C, H, W] → [C*kh*kw, N*H_out*W_out].
    Unfold {
        input: Tensor<B>,
        window: Window,
    },

    /// col2im: [C*kh*kw, N*H_out*W_out] → [N, C, H, W], overlaps summed.
    /// `image_dims` is [N, C, H, W].
    Fold {
        input: Tensor<B>,
        window: Window,
        image_dims: [usize; 4],
    },

    /// result[i] = input_flat[indices[i]], shaped by the caller.
    TakeFlat {
        input: Tensor<B>,
        indices: Arc<Vec<usize>>,
    },

    /// result_flat[indices[i]] += input[i], into a zero tensor of `out_shape`.
    ScatterFlat {
        input: Tensor<B>,
        indices: Arc<Vec<usize>>,
        out_shape: Shape,
    },
}

impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dims: dims.clone(),
                keep_dim: *keep_dim,
            },
            Op::Matmul { lhs, rhs } => Op::Matmul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Transpose { input, dim0, dim1 } => Op::Transpose {
                input: input.clone(),
                dim0: *dim0,
                dim1: *dim1,
            },
            Op::Affine { input, mul, add } => Op::Affine {
                input: input.clone(),
                mul: *mul,
                add: *add,
            },
            Op::Contiguous { input } => Op::Contiguous {
                input: input.clone(),
            },
            Op::Unfold { input, window } => Op::Unfold {
                input: input.clone(),
                window: *window,
            },
            Op::Fold {
                input,
                window,
                image_dims,
            } => Op::Fold {
                input: input.clone(),
                window: *window,
                image_dims: *image_dims,
            },
            Op::TakeFlat { input, indices } => Op::TakeFlat {
                input: input.clone(),
                indices: Arc::clone(indices),
            },
            Op::ScatterFlat {
                input,
                indices,
                out_shape,
            } => Op::ScatterFlat {
                input: input.clone(),
                indices: Arc::clone(indices),
                out_shape: out_shape.clone(),
            },
        }
    }
}

impl<B: Backend> Op<B> {
    /// Input tensors of this node, used by the topological sort.
    pub fn inputs(&self) -> Vec<&Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Affine { input, .. }
            | Op::Contiguous { input }
            | Op::Unfold { input, .. }
            | Op::Fold { input, .. }
            | Op::TakeFlat { input, .. }
            | Op::ScatterFlat { input, .. } => vec![input],
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::None)
    }
}
