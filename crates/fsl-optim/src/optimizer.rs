// Optimizer trait
//
// An optimizer holds the tensors it updates and writes new values into their
// storage in place (`update_data_inplace`). Ids and graph identity of the
// parameters are preserved, so a `GradStore` from the next backward pass
// still finds them.

use fsl_core::{Backend, GradStore, Result, Tensor};

pub trait Optimizer<B: Backend> {
    /// Apply one update from `grads`. Parameters with no gradient are left
    /// untouched. Returns handles to the updated parameters.
    fn step(&mut self, grads: &GradStore<B>) -> Result<Vec<Tensor<B>>>;

    /// The parameters this optimizer updates, in registration order.
    fn params(&self) -> &[Tensor<B>];

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// Host copies of a parameter and its gradient, if one was recorded.
pub(crate) fn host_param_and_grad<B: Backend>(
    param: &Tensor<B>,
    grads: &GradStore<B>,
) -> Result<Option<(Vec<f64>, Vec<f64>)>> {
    match grads.get(param) {
        Some(g) => Ok(Some((param.to_f64_vec()?, g.to_f64_vec()?))),
        None => Ok(None),
    }
}
