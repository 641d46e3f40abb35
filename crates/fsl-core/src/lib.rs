//! # fsl-core
//!
//! Tensor primitives, the backend trait and reverse-mode autograd for fsl.
//!
//! - [`Tensor`]: n-dimensional array that records the op graph producing it
//! - [`Shape`] / [`Layout`]: dimensions, strides and views
//! - [`DType`]: element types (F32, F64, I64)
//! - [`Backend`]: kernel interface implemented by `fsl-cpu`
//! - [`GradStore`]: gradients returned by `backward()`; they are graph nodes
//!   themselves, so gradients of gradients are available

pub mod backend;
pub mod backprop;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod op;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
pub use backprop::GradStore;
pub use dtype::DType;
pub use error::{Error, Result};
pub use layout::Layout;
pub use op::{Op, TensorId, Window};
pub use shape::Shape;
pub use tensor::Tensor;
