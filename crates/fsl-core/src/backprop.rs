// Backpropagation — reverse-mode automatic differentiation
//
// HOW IT WORKS:
//
//   1. backward() topologically sorts the graph under the scalar root
//      (iteratively, so deep unrolled inner loops cannot overflow the stack).
//   2. Nodes that do not lead to any variable are pruned: no gradient is
//      computed for input images, labels or other constants.
//   3. Starting from grad(root) = 1, each node applies its rule and the
//      contributions for its inputs are accumulated (summed).
//
// HIGHER ORDER:
//
//   Every rule below is written with graph-recording tensor ops, never by
//   reading host data back into a fresh leaf. A returned gradient is
//   therefore a function of the parameters it was taken with respect to,
//   and a loss built from it can be differentiated again. The only host-side
//   values are piecewise-constant masks (relu, max), whose derivative is
//   zero almost everywhere.
//
// GRADIENT RULES:
//
//   Add/Sub:      grad_a += g, grad_b += ±g      (summed over broadcast dims)
//   Mul:          grad_a += g * b, grad_b += g * a
//   Div:          grad_a += g / b, grad_b += -g * a / b²
//   Exp:          grad += g * exp(x)             (reuses the output)
//   Log:          grad += g / x
//   Sqrt:         grad += g / (2 sqrt(x))
//   Square:       grad += g * 2x
//   Relu:         grad += g * [x > 0]
//   Sum/Mean:     grad += expand(g) (/ n)
//   Max:          grad += expand(g) * [x == max] / ties
//   Matmul:       grad_A += g @ Bᵀ, grad_B += Aᵀ @ g
//   Reshape/Transpose/Contiguous/Affine: the inverse view or scale
//   Unfold ↔ Fold, TakeFlat ↔ ScatterFlat: each other's adjoint

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::tensor::{reduced_shape, Tensor};

/// Gradients produced by `backward()`, keyed by tensor id.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Gradient of `tensor`, if any flowed to it.
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    /// Gradient of `tensor`, or zeros of its shape when none flowed to it
    /// (the tensor did not influence the root).
    pub fn get_or_zeros(&self, tensor: &Tensor<B>) -> Result<Tensor<B>> {
        match self.grads.get(&tensor.id()) {
            Some(g) => Ok(g.clone()),
            None => Tensor::zeros_like(tensor),
        }
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Add `grad` to the gradient stored for `id`.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        let grad = match self.grads.remove(&id) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.grads.insert(id, grad);
        Ok(())
    }
}

/// Leaves first, root last. Iterative post-order DFS.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![(root.clone(), false)];
    while let Some((t, expanded)) = stack.pop() {
        if expanded {
            order.push(t);
            continue;
        }
        if !visited.insert(t.id()) {
            continue;
        }
        stack.push((t.clone(), true));
        for input in t.op().inputs() {
            if !visited.contains(&input.id()) {
                stack.push((input.clone(), false));
            }
        }
    }
    order
}

/// Ids of nodes with a path to a variable (the only ones that need grads).
fn requiring_grad<B: Backend>(topo: &[Tensor<B>]) -> HashSet<TensorId> {
    let mut needs = HashSet::new();
    for t in topo {
        if !t.dtype().is_float() {
            continue;
        }
        if t.is_variable() || t.op().inputs().iter().any(|i| needs.contains(&i.id())) {
            needs.insert(t.id());
        }
    }
    needs
}

struct Backprop<B: Backend> {
    grads: GradStore<B>,
    needs: HashSet<TensorId>,
}

impl<B: Backend> Backprop<B> {
    fn wants(&self, t: &Tensor<B>) -> bool {
        self.needs.contains(&t.id())
    }

    /// Accumulate a lazily computed gradient for `input` if it needs one.
    fn push(&mut self, input: &Tensor<B>, grad: impl FnOnce() -> Result<Tensor<B>>) -> Result<()> {
        if self.wants(input) {
            let g = grad()?;
            self.grads.accumulate(input.id(), g)?;
        }
        Ok(())
    }
}

/// Gradients of the scalar `root` with respect to every tensor in its graph
/// that leads to a variable.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(Error::NotAScalar {
            op: "backward",
            shape: root.shape().clone(),
        });
    }

    let topo = build_topo(root);
    let mut bp = Backprop {
        grads: GradStore::new(),
        needs: requiring_grad(&topo),
    };
    if !bp.wants(root) {
        return Ok(bp.grads);
    }
    let seed = Tensor::<B>::ones(root.shape().clone(), root.dtype(), root.device())?;
    bp.grads.grads.insert(root.id(), seed);

    for tensor in topo.iter().rev() {
        if !bp.wants(tensor) {
            continue;
        }
        let g = match bp.grads.grads.get(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => bp.push(input, || Ok(g.clone()))?,

            Op::Binary { lhs, rhs, op } => binary_grad(&mut bp, *op, &g, lhs, rhs)?,

            Op::Unary { input, op } => {
                let op = *op;
                bp.push(input, || unary_grad(op, &g, input, tensor))?
            }

            Op::Reduce {
                input, op, dims, ..
            } => {
                let op = *op;
                bp.push(input, || reduce_grad(op, &g, input, tensor, dims))?
            }

            Op::Matmul { lhs, rhs } => {
                // grad_A = g @ Bᵀ, grad_B = Aᵀ @ g over the last two dims
                bp.push(lhs, || {
                    let r = rhs.rank();
                    g.matmul(&rhs.transpose(r - 2, r - 1)?)
                })?;
                bp.push(rhs, || {
                    let r = lhs.rank();
                    lhs.transpose(r - 2, r - 1)?.matmul(&g)
                })?;
            }

            Op::Reshape { input, src_shape } => bp.push(input, || g.reshape(src_shape.clone()))?,

            Op::Transpose { input, dim0, dim1 } => {
                bp.push(input, || g.transpose(*dim0, *dim1))?
            }

            Op::Affine { input, mul, .. } => bp.push(input, || g.scale(*mul))?,

            Op::Unfold { input, window } => bp.push(input, || {
                let d = input.dims();
                g.fold(*window, [d[0], d[1], d[2], d[3]])
            })?,

            Op::Fold { input, window, .. } => bp.push(input, || g.unfold(*window))?,

            Op::TakeFlat { input, indices } => bp.push(input, || {
                g.scatter_flat(indices.clone(), input.shape().clone())
            })?,

            Op::ScatterFlat { input, indices, .. } => bp.push(input, || {
                g.take_flat(indices.clone(), input.shape().clone())
            })?,
        }
    }

    Ok(bp.grads)
}

fn binary_grad<B: Backend>(
    bp: &mut Backprop<B>,
    op: BinaryOp,
    g: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
) -> Result<()> {
    match op {
        BinaryOp::Add => {
            bp.push(lhs, || reduce_broadcast_grad(g, lhs.shape()))?;
            bp.push(rhs, || reduce_broadcast_grad(g, rhs.shape()))?;
        }
        BinaryOp::Sub => {
            bp.push(lhs, || reduce_broadcast_grad(g, lhs.shape()))?;
            bp.push(rhs, || reduce_broadcast_grad(&g.neg()?, rhs.shape()))?;
        }
        BinaryOp::Mul => {
            bp.push(lhs, || reduce_broadcast_grad(&g.mul(rhs)?, lhs.shape()))?;
            bp.push(rhs, || reduce_broadcast_grad(&g.mul(lhs)?, rhs.shape()))?;
        }
        BinaryOp::Div => {
            bp.push(lhs, || reduce_broadcast_grad(&g.div(rhs)?, lhs.shape()))?;
            bp.push(rhs, || {
                let raw = g.neg()?.mul(lhs)?.div(&rhs.square()?)?;
                reduce_broadcast_grad(&raw, rhs.shape())
            })?;
        }
    }
    Ok(())
}

/// Sum a broadcast gradient back down to the operand's shape.
///
/// [1, 4] broadcast to [3, 4]: sum over dim 0, keep it.
/// [4] broadcast to [3, 4]: sum over dim 0, then reshape to [4].
fn reduce_broadcast_grad<B: Backend>(grad: &Tensor<B>, target: &Shape) -> Result<Tensor<B>> {
    let grad_dims = grad.dims();
    let target_dims = target.dims();
    if grad_dims == target_dims {
        return Ok(grad.clone());
    }
    let lead = grad_dims.len() - target_dims.len();
    let dims: Vec<usize> = (0..grad_dims.len())
        .filter(|&d| d < lead || (target_dims[d - lead] == 1 && grad_dims[d] != 1))
        .collect();
    let summed = if dims.is_empty() {
        grad.clone()
    } else {
        grad.sum_dims(&dims, true)?
    };
    summed.reshape(target.clone())
}

fn unary_grad<B: Backend>(
    op: UnaryOp,
    g: &Tensor<B>,
    input: &Tensor<B>,
    output: &Tensor<B>,
) -> Result<Tensor<B>> {
    match op {
        UnaryOp::Neg => g.neg(),
        UnaryOp::Exp => g.mul(output),
        UnaryOp::Log => g.div(input),
        UnaryOp::Sqrt => g.div(&output.scale(2.0)?),
        UnaryOp::Square => g.mul(&input.scale(2.0)?),
        UnaryOp::Relu => {
            let mask: Vec<f64> = input
                .to_f64_vec()?
                .iter()
                .map(|&v| if v > 0.0 { 1.0 } else { 0.0 })
                .collect();
            let mask =
                Tensor::<B>::from_f64_slice(&mask, input.shape().clone(), input.dtype(), input.device())?;
            g.mul(&mask)
        }
    }
}

/// Broadcast the reduced gradient back over the reduced dimensions.
fn expand_reduced<B: Backend>(g: &Tensor<B>, input: &Tensor<B>, dims: &[usize]) -> Result<Tensor<B>> {
    let keep = reduced_shape(input.shape(), dims, true);
    let g_keep = g.reshape(keep)?;
    Tensor::<B>::ones_like(input)?.mul(&g_keep)
}

fn reduce_grad<B: Backend>(
    op: ReduceOp,
    g: &Tensor<B>,
    input: &Tensor<B>,
    output: &Tensor<B>,
    dims: &[usize],
) -> Result<Tensor<B>> {
    match op {
        ReduceOp::Sum => expand_reduced(g, input, dims),
        ReduceOp::Mean => {
            let n: usize = if dims.is_empty() {
                input.elem_count()
            } else {
                dims.iter().map(|&d| input.dims()[d]).product()
            };
            expand_reduced(g, input, dims)?.scale(1.0 / n.max(1) as f64)
        }
        ReduceOp::Max => {
            // Split the gradient equally among tied maxima.
            let keep = reduced_shape(input.shape(), dims, true);
            let reader = Layout::contiguous(keep).broadcast_as(input.shape())?;
            let maxima = output.to_f64_vec()?;
            let values = input.to_f64_vec()?;
            let mut ties = vec![0usize; maxima.len()];
            let owners: Vec<usize> = reader.strided_indices().collect();
            for (v, &o) in values.iter().zip(owners.iter()) {
                if *v == maxima[o] {
                    ties[o] += 1;
                }
            }
            let mask: Vec<f64> = values
                .iter()
                .zip(owners.iter())
                .map(|(v, &o)| if *v == maxima[o] { 1.0 / ties[o] as f64 } else { 0.0 })
                .collect();
            let mask =
                Tensor::<B>::from_f64_slice(&mask, input.shape().clone(), input.dtype(), input.device())?;
            expand_reduced(g, input, dims)?.mul(&mask)
        }
        ReduceOp::ArgMax => Err(Error::NotDifferentiable("argmax")),
    }
}
