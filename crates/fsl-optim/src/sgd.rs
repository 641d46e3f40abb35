// Stochastic gradient descent with optional momentum and weight decay.
//
//   g   = grad + weight_decay * p
//   buf = momentum * buf + g        (buf = g on the first step)
//   p   = p - lr * buf

use fsl_core::{Backend, GradStore, Result, Tensor};

use crate::optimizer::{host_param_and_grad, Optimizer};

pub struct SGD<B: Backend> {
    params: Vec<Tensor<B>>,
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    velocity: Vec<Option<Vec<f64>>>,
}

impl<B: Backend> SGD<B> {
    pub fn new(params: Vec<Tensor<B>>, lr: f64, momentum: f64, weight_decay: f64) -> Self {
        let velocity = vec![None; params.len()];
        SGD {
            params,
            lr,
            momentum,
            weight_decay,
            velocity,
        }
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }
}

impl<B: Backend> Optimizer<B> for SGD<B> {
    fn step(&mut self, grads: &GradStore<B>) -> Result<Vec<Tensor<B>>> {
        for (param, velocity) in self.params.iter().zip(self.velocity.iter_mut()) {
            let Some((mut p, g)) = host_param_and_grad(param, grads)? else {
                continue;
            };
            let g: Vec<f64> = g
                .iter()
                .zip(&p)
                .map(|(g, p)| g + self.weight_decay * p)
                .collect();
            let update = if self.momentum != 0.0 {
                let buf = match velocity.take() {
                    Some(mut buf) => {
                        for (b, g) in buf.iter_mut().zip(&g) {
                            *b = self.momentum * *b + g;
                        }
                        buf
                    }
                    None => g,
                };
                velocity.insert(buf).clone()
            } else {
                g
            };
            for (p, u) in p.iter_mut().zip(&update) {
                *p -= self.lr * u;
            }
            param.update_data_inplace(&p)?;
        }
        Ok(self.params.clone())
    }

    fn params(&self) -> &[Tensor<B>] {
        &self.params
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}
