// Parameter store
//
// A ParameterCollection is the flat, ordered list of tensors a LayerConfig
// consumes. The config alone determines how many slots there are, their
// shapes and their order (`LayerConfig::slot_layout`); the collection only
// carries values. Any collection with the same layout can drive the same
// config, which is how one network runs against both the meta parameters
// and a per-task adapted copy.
//
// Slots per layer kind:
//
//   conv2d [out, in, kh, kw, ..]  weight [out, in, kh, kw], bias [out]
//   bn [c]                        scale, shift, running_mean, running_var  [c]
//   linear [out, in]              weight [out, in], bias [out]
//   basicblock [out, in, ..]      conv1.weight, bn1 (4), conv2.weight, bn2 (4)
//   identity_out [out]            proj.weight [out, in, 1, 1], proj bn (4)
//                                 (`in` comes from the matching identity_in)
//
// Running statistics are buffers: stored with the parameters, never trained.

use std::ops::Range;
use std::sync::Arc;

use fsl_core::{Backend, DType, Tensor};
use fsl_nn::init::{kaiming_normal, ones, zeros};
use fsl_nn::FanMode;

use crate::config::{close_identity, LayerConfig, LayerSpec};
use crate::error::{Error, Result};

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRole {
    Weight,
    Bias,
    BnScale,
    BnShift,
    RunningMean,
    RunningVar,
}

impl SlotRole {
    /// Buffers (running statistics) are not trained.
    pub fn is_trainable(self) -> bool {
        !matches!(self, SlotRole::RunningMean | SlotRole::RunningVar)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotRole::Weight => "weight",
            SlotRole::Bias => "bias",
            SlotRole::BnScale => "scale",
            SlotRole::BnShift => "shift",
            SlotRole::RunningMean => "running_mean",
            SlotRole::RunningVar => "running_var",
        }
    }

    /// Stable numeric id used by parameter checkpoints.
    pub fn tag(self) -> u8 {
        match self {
            SlotRole::Weight => 0,
            SlotRole::Bias => 1,
            SlotRole::BnScale => 2,
            SlotRole::BnShift => 3,
            SlotRole::RunningMean => 4,
            SlotRole::RunningVar => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(SlotRole::Weight),
            1 => Some(SlotRole::Bias),
            2 => Some(SlotRole::BnScale),
            3 => Some(SlotRole::BnShift),
            4 => Some(SlotRole::RunningMean),
            5 => Some(SlotRole::RunningVar),
            _ => None,
        }
    }
}

/// Declared name, role and shape of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpec {
    /// Index of the owning layer in the config.
    pub layer: usize,
    /// e.g. `"5.basicblock.bn1.running_var"`.
    pub name: String,
    pub role: SlotRole,
    pub dims: Vec<usize>,
}

impl SlotSpec {
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Slot specs for a whole config plus the slot range of every layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    pub slots: Vec<SlotSpec>,
    pub ranges: Vec<Range<usize>>,
}

impl SlotLayout {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

struct LayoutBuilder {
    slots: Vec<SlotSpec>,
}

impl LayoutBuilder {
    fn slot(&mut self, layer: usize, prefix: &str, role: SlotRole, dims: Vec<usize>) {
        self.slots.push(SlotSpec {
            layer,
            name: format!("{}.{}", prefix, role.as_str()),
            role,
            dims,
        });
    }

    fn bn(&mut self, layer: usize, prefix: &str, c: usize) {
        for role in [
            SlotRole::BnScale,
            SlotRole::BnShift,
            SlotRole::RunningMean,
            SlotRole::RunningVar,
        ] {
            self.slot(layer, prefix, role, vec![c]);
        }
    }
}

impl LayerConfig {
    /// Allocate slot specs in declaration order.
    ///
    /// A projection pair `identity_in [in]` / `identity_out [out]` owns a 1x1
    /// conv weight and a bn. Plain markers that do not pair up own no slots
    /// and are reported by the executor when it reaches them.
    pub fn slot_layout(&self) -> Result<SlotLayout> {
        let mut b = LayoutBuilder { slots: Vec::new() };
        let mut ranges = Vec::with_capacity(self.len());
        let mut open: Vec<(usize, Option<usize>)> = Vec::new();

        for (i, spec) in self.iter().enumerate() {
            let start = b.slots.len();
            let kind = spec.kind();
            let prefix = format!("{}.{}", i, kind);
            match *spec {
                LayerSpec::Conv2d {
                    out_ch,
                    in_ch,
                    kh,
                    kw,
                    ..
                } => {
                    b.slot(i, &prefix, SlotRole::Weight, vec![out_ch, in_ch, kh, kw]);
                    b.slot(i, &prefix, SlotRole::Bias, vec![out_ch]);
                }
                LayerSpec::BatchNorm { channels } => b.bn(i, &prefix, channels),
                LayerSpec::Linear {
                    out_features,
                    in_features,
                } => {
                    b.slot(i, &prefix, SlotRole::Weight, vec![out_features, in_features]);
                    b.slot(i, &prefix, SlotRole::Bias, vec![out_features]);
                }
                LayerSpec::BasicBlock { out_ch, in_ch, .. } => {
                    let conv1 = format!("{}.conv1", prefix);
                    let conv2 = format!("{}.conv2", prefix);
                    b.slot(i, &conv1, SlotRole::Weight, vec![out_ch, in_ch, 3, 3]);
                    b.bn(i, &format!("{}.bn1", prefix), out_ch);
                    b.slot(i, &conv2, SlotRole::Weight, vec![out_ch, out_ch, 3, 3]);
                    b.bn(i, &format!("{}.bn2", prefix), out_ch);
                }
                LayerSpec::IdentityIn { channels } => open.push((i, channels)),
                LayerSpec::IdentityOut { channels } => {
                    if let Some((in_ch, out_ch)) = close_identity(&mut open, i, channels)? {
                        let proj = format!("{}.proj", prefix);
                        b.slot(i, &proj, SlotRole::Weight, vec![out_ch, in_ch, 1, 1]);
                        b.bn(i, &format!("{}.bn", proj), out_ch);
                    }
                }
                LayerSpec::Relu { .. }
                | LayerSpec::MaxPool2d { .. }
                | LayerSpec::AvgPool2d { .. }
                | LayerSpec::Flatten => {}
            }
            ranges.push(start..b.slots.len());
        }
        Ok(SlotLayout {
            slots: b.slots,
            ranges,
        })
    }
}

/// The ordered tensors a config runs against.
///
/// `Clone` shares storage with the source (handle copy). Use
/// [`ParameterCollection::clone_detached`] or [`ParameterCollection::fork`]
/// for a copy that can be modified independently.
pub struct ParameterCollection<B: Backend> {
    layout: Arc<SlotLayout>,
    tensors: Vec<Tensor<B>>,
}

impl<B: Backend> Clone for ParameterCollection<B> {
    fn clone(&self) -> Self {
        ParameterCollection {
            layout: Arc::clone(&self.layout),
            tensors: self.tensors.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for ParameterCollection<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterCollection")
            .field("slots", &self.tensors.len())
            .field("elements", &self.num_elements())
            .finish()
    }
}

impl<B: Backend> ParameterCollection<B> {
    /// Allocate and initialize every slot of `config`.
    ///
    /// Conv and linear weights: Kaiming normal (fan-in, ReLU gain).
    /// Biases and bn shifts: zero. Bn scales: one. Running mean 0, var 1.
    pub fn initialize(config: &LayerConfig, dtype: DType, device: &B::Device) -> Result<Self> {
        let layout = config.slot_layout()?;
        let mut tensors = Vec::with_capacity(layout.len());
        for slot in &layout.slots {
            let dims = slot.dims.clone();
            let t = match slot.role {
                SlotRole::Weight => kaiming_normal::<B>(dims, 0.0, FanMode::FanIn, dtype, device)?,
                SlotRole::Bias | SlotRole::BnShift => zeros::<B>(dims, dtype, device)?,
                SlotRole::BnScale => ones::<B>(dims, dtype, device)?,
                SlotRole::RunningMean => Tensor::<B>::zeros(dims, dtype, device)?,
                SlotRole::RunningVar => Tensor::<B>::ones(dims, dtype, device)?,
            };
            tensors.push(t);
        }
        Ok(ParameterCollection {
            layout: Arc::new(layout),
            tensors,
        })
    }

    /// Wrap existing tensors, checking count and shapes against `config`.
    pub fn from_tensors(config: &LayerConfig, tensors: Vec<Tensor<B>>) -> Result<Self> {
        let layout = config.slot_layout()?;
        check_tensors(&layout, &tensors)?;
        let tensors = tensors
            .into_iter()
            .zip(&layout.slots)
            .map(|(t, s)| if s.role.is_trainable() { t.set_variable() } else { t })
            .collect();
        Ok(ParameterCollection {
            layout: Arc::new(layout),
            tensors,
        })
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn slots(&self) -> &[SlotSpec] {
        &self.layout.slots
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Tensor<B>> {
        self.tensors.get(i)
    }

    pub fn tensors(&self) -> &[Tensor<B>] {
        &self.tensors
    }

    /// `(spec, tensor)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&SlotSpec, &Tensor<B>)> {
        self.layout.slots.iter().zip(&self.tensors)
    }

    /// Slot ranges consumed by each layer, indexed by layer.
    pub fn layer_slot_ranges(&self) -> &[Range<usize>] {
        &self.layout.ranges
    }

    /// Tensors of the slots consumed by `layer`.
    pub fn layer_slots(&self, layer: usize) -> &[Tensor<B>] {
        match self.layout.ranges.get(layer) {
            Some(r) => &self.tensors[r.clone()],
            None => &[],
        }
    }

    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.elem_count()).sum()
    }

    pub fn trainable_indices(&self) -> Vec<usize> {
        self.layout
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role.is_trainable())
            .map(|(i, _)| i)
            .collect()
    }

    /// Handles to the trainable slots, in slot order.
    pub fn trainable(&self) -> Vec<Tensor<B>> {
        self.iter()
            .filter(|(s, _)| s.role.is_trainable())
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Handles to the running-statistics buffers, in slot order.
    pub fn buffers(&self) -> Vec<Tensor<B>> {
        self.iter()
            .filter(|(s, _)| !s.role.is_trainable())
            .map(|(_, t)| t.clone())
            .collect()
    }

    /// Independent leaf copies: same values, new storage, no graph link.
    pub fn clone_detached(&self) -> Result<Self> {
        let tensors = self
            .iter()
            .map(|(s, t)| {
                let copy = t.copy_detached()?;
                Ok(if s.role.is_trainable() {
                    copy.set_variable()
                } else {
                    copy
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ParameterCollection {
            layout: Arc::clone(&self.layout),
            tensors,
        })
    }

    /// Graph-connected copies of the trainable slots and deep copies of the
    /// buffers.
    ///
    /// Gradients taken through the fork reach the source slots, while no
    /// write to the fork (new values, running statistics) is visible in the
    /// source.
    pub fn fork(&self) -> Result<Self> {
        let tensors = self
            .iter()
            .map(|(s, t)| {
                if s.role.is_trainable() {
                    Ok(t.affine(1.0, 0.0)?)
                } else {
                    Ok(t.copy_detached()?)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ParameterCollection {
            layout: Arc::clone(&self.layout),
            tensors,
        })
    }

    /// Same buffers, new trainable tensors (in `trainable()` order).
    pub fn with_trainable(&self, trainable: Vec<Tensor<B>>) -> Result<Self> {
        let expected = self.trainable_indices();
        if trainable.len() != expected.len() {
            return Err(Error::Shape {
                layer: 0,
                kind: "parameters",
                msg: format!(
                    "expected {} trainable tensors, got {}",
                    expected.len(),
                    trainable.len()
                ),
            });
        }
        let mut tensors = self.tensors.clone();
        for (slot, t) in expected.into_iter().zip(trainable) {
            let spec = &self.layout.slots[slot];
            if t.dims() != spec.dims.as_slice() {
                return Err(slot_shape_error(spec, t.dims()));
            }
            tensors[slot] = t;
        }
        Ok(ParameterCollection {
            layout: Arc::clone(&self.layout),
            tensors,
        })
    }

    /// Check that this collection can drive a config with `layout`.
    pub fn check_layout(&self, layout: &SlotLayout) -> Result<()> {
        if self.layout.slots.len() != layout.slots.len() {
            return Err(Error::Shape {
                layer: 0,
                kind: "parameters",
                msg: format!(
                    "config needs {} parameter slots, collection has {}",
                    layout.slots.len(),
                    self.layout.slots.len()
                ),
            });
        }
        for (mine, theirs) in self.layout.slots.iter().zip(&layout.slots) {
            if mine.dims != theirs.dims || mine.role != theirs.role {
                return Err(slot_shape_error(theirs, &mine.dims));
            }
        }
        Ok(())
    }

    /// True if any slot of `self` shares storage with any slot of `other`.
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        self.tensors
            .iter()
            .any(|a| other.tensors.iter().any(|b| a.shares_storage_with(b)))
    }

    /// Overwrite every buffer with the element-wise mean of the matching
    /// buffers in `sources` (all with this layout).
    pub fn average_buffers_from(&self, sources: &[&ParameterCollection<B>]) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }
        for source in sources {
            self.check_layout(&source.layout)?;
        }
        for (i, spec) in self.layout.slots.iter().enumerate() {
            if spec.role.is_trainable() {
                continue;
            }
            let mut acc = vec![0.0; spec.elem_count()];
            for source in sources {
                for (a, v) in acc.iter_mut().zip(source.tensors[i].to_f64_vec()?) {
                    *a += v;
                }
            }
            let n = sources.len() as f64;
            acc.iter_mut().for_each(|a| *a /= n);
            self.tensors[i].update_data_inplace(&acc)?;
        }
        Ok(())
    }
}

fn slot_shape_error(spec: &SlotSpec, got: &[usize]) -> Error {
    Error::Shape {
        layer: spec.layer,
        kind: "parameters",
        msg: format!(
            "slot {} ({}) expects {:?}, got {:?}",
            spec.name,
            spec.role.as_str(),
            spec.dims,
            got
        ),
    }
}

fn check_tensors<B: Backend>(layout: &SlotLayout, tensors: &[Tensor<B>]) -> Result<()> {
    if tensors.len() != layout.len() {
        return Err(Error::Shape {
            layer: 0,
            kind: "parameters",
            msg: format!(
                "config needs {} parameter slots, got {} tensors",
                layout.len(),
                tensors.len()
            ),
        });
    }
    for (spec, t) in layout.slots.iter().zip(tensors) {
        if t.dims() != spec.dims.as_slice() {
            return Err(slot_shape_error(spec, t.dims()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{conv4_no_classifier, resnet18, resnet18_no_head, Arg, LayerKind};

    #[test]
    fn test_conv4_layout() -> Result<()> {
        let layout = conv4_no_classifier().slot_layout()?;
        // (conv weight + bias + 4 bn) per stage
        assert_eq!(layout.len(), 24);
        assert_eq!(layout.slots[0].dims, vec![32, 3, 3, 3]);
        assert_eq!(layout.slots[6].dims, vec![32, 32, 3, 3]);
        assert_eq!(layout.ranges.len(), 17);
        assert_eq!(layout.ranges[0], 0..2);
        assert_eq!(layout.ranges[1], 2..2);
        assert_eq!(layout.ranges[2], 2..6);
        Ok(())
    }

    #[test]
    fn test_resnet_layout() -> Result<()> {
        let layout = resnet18_no_head().slot_layout()?;
        // stem 6, 10 blocks x 10, 3 projections x 5
        assert_eq!(layout.len(), 6 + 100 + 15);
        let proj = layout
            .slots
            .iter()
            .find(|s| s.name.contains("proj.weight"))
            .map(|s| s.dims.clone());
        assert_eq!(proj, Some(vec![128, 64, 1, 1]));
        assert_eq!(resnet18(5)?.slot_layout()?.len(), 123);
        Ok(())
    }

    #[test]
    fn test_one_sided_projection_is_rejected_by_from_json() {
        let parsed = LayerConfig::from_json(r#"[["identity_in", [4]], ["relu", []], ["identity_out", []]]"#);
        assert!(matches!(parsed, Err(Error::Config(_))));
        let parsed = LayerConfig::from_json(r#"[["identity_out", [4]]]"#);
        assert!(matches!(parsed, Err(Error::Config(_))));
    }

    #[test]
    fn test_projection_pair_slots() -> Result<()> {
        let config = LayerConfig::new()
            .with(LayerKind::IdentityIn, &[Arg::Int(4)])?
            .with(LayerKind::IdentityOut, &[Arg::Int(8)])?;
        let layout = config.slot_layout()?;
        assert_eq!(layout.ranges[0], 0..0);
        assert_eq!(layout.ranges[1], 0..5);
        assert_eq!(layout.slots[0].dims, vec![8, 4, 1, 1]);
        assert_eq!(layout.slots[0].name, "1.identity_out.proj.weight");
        Ok(())
    }

    #[test]
    fn test_slot_names() -> Result<()> {
        let layout = resnet18_no_head().slot_layout()?;
        assert_eq!(layout.slots[0].name, "0.conv2d.weight");
        assert_eq!(layout.slots[5].name, "1.bn.running_var");
        assert_eq!(layout.slots[6].name, "5.basicblock.conv1.weight");
        assert_eq!(layout.slots[7].name, "5.basicblock.bn1.scale");
        Ok(())
    }
}
