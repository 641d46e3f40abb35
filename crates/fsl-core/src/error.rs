use crate::shape::Shape;

/// Failures of the tensor runtime: kernels, views, image ops and autograd.
///
/// `fsl_meta::Error::Tensor` carries these through the executor, so a
/// message here should name the operation that failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    #[error("dim {dim} out of range for rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },

    /// A scalar was required (`to_scalar_f64`, the root of `backward`).
    #[error("{op}: expected a single element, got shape {shape}")]
    NotAScalar { op: &'static str, shape: Shape },

    /// Host data, a reshape target or an index list has the wrong length.
    #[error("{op}: shape {shape} holds {expected} elements, got {got}")]
    ElementCountMismatch {
        op: &'static str,
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error("matmul: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// conv2d input channels differ from the weight's.
    #[error("conv2d: input has {input} channels, weight expects {weight}")]
    ChannelMismatch { input: usize, weight: usize },

    /// A sliding-window kernel does not fit the (padded) input.
    #[error("window {kernel:?} with padding {padding:?} does not fit input of spatial size {input:?}")]
    WindowTooLarge {
        kernel: [usize; 2],
        padding: [usize; 2],
        input: [usize; 2],
    },

    /// A gather or scatter index past the end of its buffer.
    #[error("{op}: index {index} out of range for {len} elements")]
    IndexOutOfRange {
        op: &'static str,
        index: usize,
        len: usize,
    },

    #[error("{0} has no gradient")]
    NotDifferentiable(&'static str),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
