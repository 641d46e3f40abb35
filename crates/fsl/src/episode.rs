//! Synthetic N-way K-shot episodes.
//!
//! Each class gets a random template image; its examples are the template
//! plus uniform noise. Used by the `meta-step` command and the tests.

use fsl_core::{Backend, DType, Tensor};
use fsl_meta::Task;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeConfig {
    /// Number of classes per episode.
    pub n_way: usize,
    /// Support examples per class.
    pub k_shot: usize,
    /// Query examples per class.
    pub n_query: usize,
    /// Image `[C, H, W]`.
    pub image_dims: [usize; 3],
    /// Half-width of the uniform noise added to each template.
    pub noise: f64,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        EpisodeConfig {
            n_way: 5,
            k_shot: 5,
            n_query: 15,
            image_dims: [3, 84, 84],
            noise: 0.5,
        }
    }
}

fn images<B: Backend, R: Rng>(
    rng: &mut R,
    templates: &[Vec<f64>],
    per_class: usize,
    config: &EpisodeConfig,
    dtype: DType,
    device: &B::Device,
) -> Result<(Tensor<B>, Vec<usize>)> {
    let mut data = Vec::with_capacity(templates.len() * per_class * templates.first().map_or(0, Vec::len));
    let mut labels = Vec::with_capacity(templates.len() * per_class);
    for (class, template) in templates.iter().enumerate() {
        for _ in 0..per_class {
            data.extend(template.iter().map(|v| v + rng.gen_range(-config.noise..=config.noise)));
            labels.push(class);
        }
    }
    let [c, h, w] = config.image_dims;
    let x = Tensor::<B>::from_f64_slice(&data, (labels.len(), c, h, w), dtype, device)?;
    Ok((x, labels))
}

/// One random episode with labels `0..n_way`, grouped by class.
pub fn synthetic_task<B: Backend, R: Rng>(
    rng: &mut R,
    config: &EpisodeConfig,
    dtype: DType,
    device: &B::Device,
) -> Result<Task<B>> {
    if config.n_way == 0 || config.k_shot == 0 || config.n_query == 0 {
        return Err(Error::Meta(fsl_meta::Error::InvalidTask(format!(
            "episode needs positive n_way, k_shot and n_query, got {:?}",
            config
        ))));
    }
    if !config.noise.is_finite() || config.noise < 0.0 {
        return Err(Error::Meta(fsl_meta::Error::config(format!("invalid noise {}", config.noise))));
    }
    let size: usize = config.image_dims.iter().product();
    let templates: Vec<Vec<f64>> = (0..config.n_way)
        .map(|_| (0..size).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();
    let (support_x, support_y) = images(rng, &templates, config.k_shot, config, dtype, device)?;
    let (query_x, query_y) = images(rng, &templates, config.n_query, config, dtype, device)?;
    Ok(Task::new(support_x, support_y, query_x, query_y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsl_cpu::{CpuBackend, CpuDevice};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_episode_layout() -> Result<()> {
        let config = EpisodeConfig {
            n_way: 3,
            k_shot: 2,
            n_query: 4,
            image_dims: [1, 5, 5],
            noise: 0.1,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let task = synthetic_task::<CpuBackend, _>(&mut rng, &config, DType::F32, &CpuDevice)?;
        assert_eq!(task.support_x.dims(), &[6, 1, 5, 5]);
        assert_eq!(task.support_y, vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(task.query_y.len(), 12);
        task.validate(3)?;
        Ok(())
    }

    #[test]
    fn test_same_seed_same_episode() -> Result<()> {
        let config = EpisodeConfig {
            image_dims: [1, 4, 4],
            ..EpisodeConfig::default()
        };
        let a = synthetic_task::<CpuBackend, _>(&mut StdRng::seed_from_u64(7), &config, DType::F64, &CpuDevice)?;
        let b = synthetic_task::<CpuBackend, _>(&mut StdRng::seed_from_u64(7), &config, DType::F64, &CpuDevice)?;
        assert_eq!(a.query_x.to_f64_vec()?, b.query_x.to_f64_vec()?);
        Ok(())
    }
}
