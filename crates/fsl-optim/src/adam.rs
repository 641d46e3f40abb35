// Adam (Kingma & Ba, 2015) with bias correction.
//
//   m = β1 m + (1 - β1) g
//   v = β2 v + (1 - β2) g²
//   p = p - lr * m̂ / (sqrt(v̂) + ε),  m̂ = m / (1 - β1^t),  v̂ = v / (1 - β2^t)
//
// The meta-learning outer loop uses this for the meta parameters.

use fsl_core::{Backend, GradStore, Result, Tensor};

use crate::optimizer::{host_param_and_grad, Optimizer};

pub struct Adam<B: Backend> {
    params: Vec<Tensor<B>>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    step_count: u64,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
}

impl<B: Backend> Adam<B> {
    pub fn new(params: Vec<Tensor<B>>, lr: f64) -> Self {
        let m = params.iter().map(|p| vec![0.0; p.elem_count()]).collect();
        let v = params.iter().map(|p| vec![0.0; p.elem_count()]).collect();
        Adam {
            params,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            step_count: 0,
            m,
            v,
        }
    }

    pub fn beta1(mut self, beta1: f64) -> Self {
        self.beta1 = beta1;
        self
    }

    pub fn beta2(mut self, beta2: f64) -> Self {
        self.beta2 = beta2;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Number of `step` calls so far.
    pub fn step_count(&self) -> u64 {
        self.step_count
    }
}

impl<B: Backend> Optimizer<B> for Adam<B> {
    fn step(&mut self, grads: &GradStore<B>) -> Result<Vec<Tensor<B>>> {
        self.step_count += 1;
        let t = self.step_count as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);

        for (i, param) in self.params.iter().enumerate() {
            let Some((mut p, g)) = host_param_and_grad(param, grads)? else {
                continue;
            };
            let (m, v) = (&mut self.m[i], &mut self.v[i]);
            for j in 0..p.len() {
                let g = g[j] + self.weight_decay * p[j];
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g * g;
                let m_hat = m[j] / bc1;
                let v_hat = v[j] / bc2;
                p[j] -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
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
