// Few-shot task: a labeled support set to adapt on and a labeled query set to
// evaluate on, sharing one label space of `num_ways` classes.

use fsl_core::{Backend, Tensor};

use crate::error::{Error, Result};

pub struct Task<B: Backend> {
    /// `[N_s, C, H, W]`
    pub support_x: Tensor<B>,
    pub support_y: Vec<usize>,
    /// `[N_q, C, H, W]`
    pub query_x: Tensor<B>,
    pub query_y: Vec<usize>,
}

impl<B: Backend> Clone for Task<B> {
    fn clone(&self) -> Self {
        Task {
            support_x: self.support_x.clone(),
            support_y: self.support_y.clone(),
            query_x: self.query_x.clone(),
            query_y: self.query_y.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Task<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("support", &self.support_x.dims())
            .field("query", &self.query_x.dims())
            .finish()
    }
}

impl<B: Backend> Task<B> {
    pub fn new(
        support_x: Tensor<B>,
        support_y: Vec<usize>,
        query_x: Tensor<B>,
        query_y: Vec<usize>,
    ) -> Self {
        Task {
            support_x,
            support_y,
            query_x,
            query_y,
        }
    }

    /// Check image ranks, batch/label agreement and the label range.
    pub fn validate(&self, num_ways: usize) -> Result<()> {
        for (name, x, y) in [
            ("support", &self.support_x, &self.support_y),
            ("query", &self.query_x, &self.query_y),
        ] {
            if x.rank() != 4 {
                return Err(Error::InvalidTask(format!(
                    "{} images must be [N, C, H, W], got {:?}",
                    name,
                    x.dims()
                )));
            }
            if x.dims()[0] != y.len() {
                return Err(Error::InvalidTask(format!(
                    "{} has {} images but {} labels",
                    name,
                    x.dims()[0],
                    y.len()
                )));
            }
            if y.is_empty() {
                return Err(Error::InvalidTask(format!("{} set is empty", name)));
            }
            if let Some(bad) = y.iter().find(|&&l| l >= num_ways) {
                return Err(Error::InvalidTask(format!(
                    "{} label {} out of range for {} ways",
                    name, bad, num_ways
                )));
            }
        }
        if self.support_x.dims()[1..] != self.query_x.dims()[1..] {
            return Err(Error::InvalidTask(format!(
                "support images {:?} and query images {:?} differ in [C, H, W]",
                self.support_x.dims(),
                self.query_x.dims()
            )));
        }
        Ok(())
    }

    /// Support indices grouped by class, classes in `0..num_ways`.
    pub fn support_by_class(&self, num_ways: usize) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); num_ways];
        for (i, &label) in self.support_y.iter().enumerate() {
            if let Some(g) = groups.get_mut(label) {
                g.push(i);
            }
        }
        groups
    }
}
