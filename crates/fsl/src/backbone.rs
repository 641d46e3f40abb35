// Backbones and the backbone registry
//
// A backbone maps [N, C, H, W] images to [N, D] embeddings. The builtin ones
// are layer configs run by the executor against their own parameter
// collection, so the fine-tuning heads can run the same config against a
// private copy of the parameters.
//
// The registry resolves an architecture name to a loader. Names of the
// pretrained transformer and self-supervised ResNet-50 backbones are known,
// but loading them needs weights and model code from outside this crate, so
// they resolve only once a caller registers a loader under that name.

use std::collections::BTreeMap;

use fsl_core::{Backend, DType, Tensor};
use fsl_meta::config::{conv4_backbone, resnet18_no_head};
use fsl_meta::{forward, LayerConfig, Mode, ParameterCollection};
use tracing::info;

use crate::checkpoint;
use crate::error::{Error, Result};
use crate::model::ModelArgs;

/// Hidden width of the builtin CNN4 backbone.
pub const CONV4_HIDDEN: usize = 64;

/// Architectures that resolve only through an externally registered loader.
pub const EXTERNAL_ARCHS: &[&str] = &[
    "vit_base_patch16_224_in21k",
    "dino_base_patch16",
    "deit_base_patch16",
    "deit_small_patch16",
    "dino_small_patch16",
    "beit_base_patch16_224_pt22k",
    "clip_base_patch16_224",
    "clip_resnet50",
    "dino_resnet50",
    "resnet50",
    "dino_xcit_medium_24_p16",
    "dino_xcit_medium_24_p8",
    "simclrv2_resnet50",
    "mocov2_resnet50",
    "swav_resnet50",
    "barlow_resnet50",
];

pub trait Backbone<B: Backend> {
    fn name(&self) -> &str;

    /// Width `D` of the `[N, D]` embeddings.
    fn embed_dim(&self) -> usize;

    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;
}

/// A backbone defined by a layer config and a parameter collection.
pub struct ConfigBackbone<B: Backend> {
    name: String,
    config: LayerConfig,
    params: ParameterCollection<B>,
    input_dims: Vec<usize>,
    embed_dim: usize,
    mode: Mode,
}

impl<B: Backend> ConfigBackbone<B> {
    /// Wrap existing parameters. `input_dims` is a representative
    /// `[N, C, H, W]` input used to infer the embedding width.
    pub fn new(
        name: impl Into<String>,
        config: LayerConfig,
        params: ParameterCollection<B>,
        input_dims: &[usize],
    ) -> Result<Self> {
        params.check_layout(&config.slot_layout()?)?;
        let embed_dim = config.embed_dim(input_dims)?;
        Ok(ConfigBackbone {
            name: name.into(),
            config,
            params,
            input_dims: input_dims.to_vec(),
            embed_dim,
            mode: Mode::Eval,
        })
    }

    /// Freshly initialised parameters for `config`.
    pub fn initialize(
        name: impl Into<String>,
        config: LayerConfig,
        input_dims: &[usize],
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let params = ParameterCollection::initialize(&config, dtype, device)?;
        Self::new(name, config, params, input_dims)
    }

    /// Batch-norm mode used by [`Backbone::forward`] and the fine-tuning heads.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn params(&self) -> &ParameterCollection<B> {
        &self.params
    }

    pub fn input_dims(&self) -> &[usize] {
        &self.input_dims
    }

    /// Run the backbone's config with another collection of the same layout.
    pub fn forward_with(
        &self,
        params: &ParameterCollection<B>,
        x: &Tensor<B>,
        mode: Mode,
    ) -> Result<Tensor<B>> {
        Ok(forward(&self.config, params, x, mode)?)
    }

    /// Overwrite the parameters from a checkpoint written for this config.
    pub fn load_checkpoint(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        checkpoint::load_into(path, &self.params)
    }
}

impl<B: Backend> Backbone<B> for ConfigBackbone<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.forward_with(&self.params, x, self.mode)
    }
}

impl<B: Backend> std::fmt::Debug for ConfigBackbone<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigBackbone")
            .field("name", &self.name)
            .field("layers", &self.config.len())
            .field("slots", &self.params.len())
            .field("embed_dim", &self.embed_dim)
            .field("mode", &self.mode)
            .finish()
    }
}

pub type BackboneLoader<B> = Box<
    dyn Fn(&ModelArgs, DType, &<B as Backend>::Device) -> Result<ConfigBackbone<B>> + Send + Sync,
>;

/// Architecture name → loader.
pub struct BackboneRegistry<B: Backend> {
    loaders: BTreeMap<String, BackboneLoader<B>>,
}

impl<B: Backend> Default for BackboneRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

fn image_dims(args: &ModelArgs) -> [usize; 4] {
    [1, 3, args.image_size, args.image_size]
}

impl<B: Backend> BackboneRegistry<B> {
    /// A registry with the builtin `conv4` and `resnet18` backbones.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("conv4", |args, dtype, device| {
            ConfigBackbone::initialize(
                "conv4",
                conv4_backbone(CONV4_HIDDEN)?,
                &image_dims(args),
                dtype,
                device,
            )
        });
        registry.register("resnet18", |args, dtype, device| {
            if !args.no_pretrain && args.pretrained.is_none() {
                return Err(Error::UnknownBackbone {
                    name: "resnet18".into(),
                    reason: "pretrained weights need a checkpoint path; set `pretrained` or `no_pretrain`"
                        .into(),
                });
            }
            ConfigBackbone::initialize(
                "resnet18",
                resnet18_no_head(),
                &image_dims(args),
                dtype,
                device,
            )
        });
        registry
    }

    pub fn empty() -> Self {
        BackboneRegistry {
            loaders: BTreeMap::new(),
        }
    }

    /// Register (or replace) the loader for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, loader: F)
    where
        F: Fn(&ModelArgs, DType, &B::Device) -> Result<ConfigBackbone<B>> + Send + Sync + 'static,
    {
        self.loaders.insert(name.into(), Box::new(loader));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.loaders.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }

    /// Build the backbone named by `args.arch`, then apply `args.pretrained`
    /// when it is set.
    pub fn load(&self, args: &ModelArgs, dtype: DType, device: &B::Device) -> Result<ConfigBackbone<B>> {
        let loader = self.loaders.get(&args.arch).ok_or_else(|| Error::UnknownBackbone {
            name: args.arch.clone(),
            reason: if EXTERNAL_ARCHS.contains(&args.arch.as_str()) {
                "needs an external loader".into()
            } else {
                "not considered".into()
            },
        })?;
        let backbone = loader(args, dtype, device)?;
        if let Some(path) = &args.pretrained {
            backbone.load_checkpoint(path)?;
            info!(arch = %args.arch, path = %path.display(), "loaded backbone weights");
        }
        info!(
            arch = %args.arch,
            slots = backbone.params().len(),
            embed_dim = backbone.embed_dim(),
            "backbone ready"
        );
        Ok(backbone)
    }
}
