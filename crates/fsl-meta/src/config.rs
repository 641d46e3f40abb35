// Layer-spec config
//
// A network is an ordered list of (kind, args) entries. On the wire (JSON) it
// keeps exactly that shape:
//
//   [["conv2d", [32, 3, 3, 3, 1, 0]], ["relu", [true]], ["bn", [32]], ...]
//
// In memory every entry is parsed once into a typed `LayerSpec`, so argument
// arity and types are checked when the config is built and the executor can
// match exhaustively on the kind.
//
// The order of entries is the binding contract with a ParameterCollection:
// slots are allocated in declaration order.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The closed set of layer kinds the executor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Conv2d,
    Relu,
    BatchNorm,
    MaxPool2d,
    AvgPool2d,
    Flatten,
    Linear,
    BasicBlock,
    IdentityIn,
    IdentityOut,
}

impl LayerKind {
    pub const ALL: [LayerKind; 10] = [
        LayerKind::Conv2d,
        LayerKind::Relu,
        LayerKind::BatchNorm,
        LayerKind::MaxPool2d,
        LayerKind::AvgPool2d,
        LayerKind::Flatten,
        LayerKind::Linear,
        LayerKind::BasicBlock,
        LayerKind::IdentityIn,
        LayerKind::IdentityOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Conv2d => "conv2d",
            LayerKind::Relu => "relu",
            LayerKind::BatchNorm => "bn",
            LayerKind::MaxPool2d => "max_pool2d",
            LayerKind::AvgPool2d => "avg_pool2d",
            LayerKind::Flatten => "flatten",
            LayerKind::Linear => "linear",
            LayerKind::BasicBlock => "basicblock",
            LayerKind::IdentityIn => "identity_in",
            LayerKind::IdentityOut => "identity_out",
        }
    }
}

impl FromStr for LayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LayerKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::config(format!("unknown layer kind '{}'", s)))
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One numeric or boolean layer argument as it appears in the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl From<usize> for Arg {
    fn from(v: usize) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Bool(v)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Bool(b) => write!(f, "{}", b),
            Arg::Int(i) => write!(f, "{}", i),
            Arg::Float(x) => write!(f, "{}", x),
        }
    }
}

/// A parsed config entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerSpec {
    Conv2d {
        out_ch: usize,
        in_ch: usize,
        kh: usize,
        kw: usize,
        stride: usize,
        pad: usize,
    },
    Relu {
        inplace: bool,
    },
    BatchNorm {
        channels: usize,
    },
    MaxPool2d {
        kernel: usize,
        stride: usize,
        pad: usize,
    },
    AvgPool2d {
        kernel: usize,
        stride: usize,
        pad: usize,
    },
    Flatten,
    Linear {
        out_features: usize,
        in_features: usize,
    },
    BasicBlock {
        out_ch: usize,
        in_ch: usize,
        stride: usize,
        expansion: usize,
    },
    /// Stash the activation. `channels` declares the input width of a
    /// projection skip and must be paired with `identity_out [out]`.
    IdentityIn {
        channels: Option<usize>,
    },
    /// Add the stashed activation back, through a 1x1 projection when
    /// `channels` is given.
    IdentityOut {
        channels: Option<usize>,
    },
}

/// Reads typed arguments off an argument list, reporting the layer kind.
struct ArgReader<'a> {
    kind: LayerKind,
    args: &'a [Arg],
}

impl ArgReader<'_> {
    fn arity(&self, allowed: &[usize]) -> Result<()> {
        if allowed.contains(&self.args.len()) {
            return Ok(());
        }
        let want = allowed
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" or ");
        Err(Error::config(format!(
            "{} takes {} argument(s), got {}",
            self.kind,
            want,
            self.args.len()
        )))
    }

    fn int(&self, i: usize, name: &str) -> Result<usize> {
        match self.args.get(i) {
            Some(Arg::Int(v)) if *v >= 0 => Ok(*v as usize),
            Some(other) => Err(Error::config(format!(
                "{}: argument {} ({}) must be a non-negative integer, got {}",
                self.kind, i, name, other
            ))),
            None => Err(Error::config(format!(
                "{}: missing argument {} ({})",
                self.kind, i, name
            ))),
        }
    }

    fn positive(&self, i: usize, name: &str) -> Result<usize> {
        let v = self.int(i, name)?;
        if v == 0 {
            return Err(Error::config(format!(
                "{}: argument {} ({}) must be positive",
                self.kind, i, name
            )));
        }
        Ok(v)
    }

    fn optional_positive(&self, i: usize, name: &str) -> Result<Option<usize>> {
        if i < self.args.len() {
            self.positive(i, name).map(Some)
        } else {
            Ok(None)
        }
    }

    fn bool(&self, i: usize, name: &str) -> Result<bool> {
        match self.args.get(i) {
            Some(Arg::Bool(b)) => Ok(*b),
            Some(other) => Err(Error::config(format!(
                "{}: argument {} ({}) must be a boolean, got {}",
                self.kind, i, name, other
            ))),
            None => Err(Error::config(format!(
                "{}: missing argument {} ({})",
                self.kind, i, name
            ))),
        }
    }
}

impl LayerSpec {
    /// Parse and validate one `(kind, args)` entry.
    pub fn build(kind: LayerKind, args: &[Arg]) -> Result<Self> {
        let r = ArgReader { kind, args };
        let spec = match kind {
            LayerKind::Conv2d => {
                r.arity(&[6])?;
                LayerSpec::Conv2d {
                    out_ch: r.positive(0, "out_ch")?,
                    in_ch: r.positive(1, "in_ch")?,
                    kh: r.positive(2, "kernel_h")?,
                    kw: r.positive(3, "kernel_w")?,
                    stride: r.positive(4, "stride")?,
                    pad: r.int(5, "pad")?,
                }
            }
            LayerKind::Relu => {
                r.arity(&[0, 1])?;
                let inplace = if args.is_empty() {
                    false
                } else {
                    r.bool(0, "inplace")?
                };
                LayerSpec::Relu { inplace }
            }
            LayerKind::BatchNorm => {
                r.arity(&[1])?;
                LayerSpec::BatchNorm {
                    channels: r.positive(0, "channels")?,
                }
            }
            LayerKind::MaxPool2d | LayerKind::AvgPool2d => {
                r.arity(&[3])?;
                let kernel = r.positive(0, "kernel")?;
                let stride = r.positive(1, "stride")?;
                let pad = r.int(2, "pad")?;
                if kind == LayerKind::MaxPool2d {
                    LayerSpec::MaxPool2d {
                        kernel,
                        stride,
                        pad,
                    }
                } else {
                    LayerSpec::AvgPool2d {
                        kernel,
                        stride,
                        pad,
                    }
                }
            }
            LayerKind::Flatten => {
                r.arity(&[0])?;
                LayerSpec::Flatten
            }
            LayerKind::Linear => {
                r.arity(&[2])?;
                LayerSpec::Linear {
                    out_features: r.positive(0, "out_features")?,
                    in_features: r.positive(1, "in_features")?,
                }
            }
            LayerKind::BasicBlock => {
                r.arity(&[4])?;
                let expansion = r.positive(3, "expansion")?;
                if expansion != 1 {
                    return Err(Error::config(format!(
                        "basicblock: expansion must be 1, got {}",
                        expansion
                    )));
                }
                LayerSpec::BasicBlock {
                    out_ch: r.positive(0, "out_ch")?,
                    in_ch: r.positive(1, "in_ch")?,
                    stride: r.positive(2, "stride")?,
                    expansion,
                }
            }
            LayerKind::IdentityIn => {
                r.arity(&[0, 1])?;
                LayerSpec::IdentityIn {
                    channels: r.optional_positive(0, "in_ch")?,
                }
            }
            LayerKind::IdentityOut => {
                r.arity(&[0, 1])?;
                LayerSpec::IdentityOut {
                    channels: r.optional_positive(0, "out_ch")?,
                }
            }
        };
        Ok(spec)
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            LayerSpec::Conv2d { .. } => LayerKind::Conv2d,
            LayerSpec::Relu { .. } => LayerKind::Relu,
            LayerSpec::BatchNorm { .. } => LayerKind::BatchNorm,
            LayerSpec::MaxPool2d { .. } => LayerKind::MaxPool2d,
            LayerSpec::AvgPool2d { .. } => LayerKind::AvgPool2d,
            LayerSpec::Flatten => LayerKind::Flatten,
            LayerSpec::Linear { .. } => LayerKind::Linear,
            LayerSpec::BasicBlock { .. } => LayerKind::BasicBlock,
            LayerSpec::IdentityIn { .. } => LayerKind::IdentityIn,
            LayerSpec::IdentityOut { .. } => LayerKind::IdentityOut,
        }
    }

    /// The wire-format argument list.
    pub fn args(&self) -> Vec<Arg> {
        match *self {
            LayerSpec::Conv2d {
                out_ch,
                in_ch,
                kh,
                kw,
                stride,
                pad,
            } => [out_ch, in_ch, kh, kw, stride, pad].map(Arg::from).to_vec(),
            LayerSpec::Relu { inplace } => vec![Arg::Bool(inplace)],
            LayerSpec::BatchNorm { channels } => vec![channels.into()],
            LayerSpec::MaxPool2d {
                kernel,
                stride,
                pad,
            }
            | LayerSpec::AvgPool2d {
                kernel,
                stride,
                pad,
            } => [kernel, stride, pad].map(Arg::from).to_vec(),
            LayerSpec::Flatten => Vec::new(),
            LayerSpec::Linear {
                out_features,
                in_features,
            } => vec![out_features.into(), in_features.into()],
            LayerSpec::BasicBlock {
                out_ch,
                in_ch,
                stride,
                expansion,
            } => [out_ch, in_ch, stride, expansion].map(Arg::from).to_vec(),
            LayerSpec::IdentityIn { channels } | LayerSpec::IdentityOut { channels } => {
                channels.into_iter().map(Arg::from).collect()
            }
        }
    }
}

impl fmt::Display for LayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self
            .args()
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}[{}]", self.kind(), args)
    }
}

/// Wire form of one entry.
pub type RawLayer = (String, Vec<Arg>);

/// Close the innermost open `identity_in` with an `identity_out` declaring
/// `out_ch`. Returns the projection `(in_ch, out_ch)` when the pair has one.
///
/// Both markers of a projection carry channel counts. A plain `identity_out`
/// with nothing open is left to the executor, which reports it as unmatched.
pub(crate) fn close_identity(
    open: &mut Vec<(usize, Option<usize>)>,
    layer: usize,
    out_ch: Option<usize>,
) -> Result<Option<(usize, usize)>> {
    match (open.pop(), out_ch) {
        (Some((_, Some(in_ch))), Some(out_ch)) => Ok(Some((in_ch, out_ch))),
        (Some((_, None)), None) | (None, None) => Ok(None),
        (Some((j, Some(_))), None) => Err(Error::config(format!(
            "identity_in at layer {} declares a projection but identity_out at layer {} does not",
            j, layer
        ))),
        (Some((j, None)), Some(_)) => Err(Error::config(format!(
            "identity_out at layer {} declares a projection but identity_in at layer {} does not",
            layer, j
        ))),
        (None, Some(_)) => Err(Error::config(format!(
            "projection identity_out at layer {} has no preceding identity_in",
            layer
        ))),
    }
}

fn check_markers(layers: &[LayerSpec]) -> Result<()> {
    let mut open = Vec::new();
    for (i, spec) in layers.iter().enumerate() {
        match *spec {
            LayerSpec::IdentityIn { channels } => open.push((i, channels)),
            LayerSpec::IdentityOut { channels } => {
                close_identity(&mut open, i, channels)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn layer_err(i: usize, e: Error) -> Error {
    Error::config(format!("layer {}: {}", i, e))
}

/// An ordered, validated list of layer specs.
///
/// Every constructor checks each entry's arguments and the projection
/// declarations of the identity markers, so a `LayerConfig` that exists
/// never fails later with `Error::Config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<RawLayer>", into = "Vec<RawLayer>")]
pub struct LayerConfig {
    layers: Vec<LayerSpec>,
}

impl LayerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from typed specs. Each spec is re-checked as if it had been
    /// parsed from its wire form.
    pub fn from_layers(layers: Vec<LayerSpec>) -> Result<Self> {
        let layers = layers
            .iter()
            .enumerate()
            .map(|(i, spec)| LayerSpec::build(spec.kind(), &spec.args()).map_err(|e| layer_err(i, e)))
            .collect::<Result<Vec<_>>>()?;
        check_markers(&layers)?;
        Ok(LayerConfig { layers })
    }

    /// Build from `(kind, args)` string-tagged tuples.
    pub fn from_raw<S: AsRef<str>>(raw: &[(S, Vec<Arg>)]) -> Result<Self> {
        let mut layers = Vec::with_capacity(raw.len());
        for (i, (kind, args)) in raw.iter().enumerate() {
            let kind: LayerKind = kind.as_ref().parse().map_err(|e| layer_err(i, e))?;
            layers.push(LayerSpec::build(kind, args).map_err(|e| layer_err(i, e))?);
        }
        check_markers(&layers)?;
        Ok(LayerConfig { layers })
    }

    pub fn to_raw(&self) -> Vec<RawLayer> {
        self.layers
            .iter()
            .map(|l| (l.kind().as_str().to_string(), l.args()))
            .collect()
    }

    /// Append a validated entry.
    pub fn push(&mut self, kind: LayerKind, args: &[Arg]) -> Result<&mut Self> {
        let spec = LayerSpec::build(kind, args).map_err(|e| layer_err(self.len(), e))?;
        self.append(&[spec])
    }

    /// Builder form of `push`.
    pub fn with(mut self, kind: LayerKind, args: &[Arg]) -> Result<Self> {
        self.push(kind, args)?;
        Ok(self)
    }

    pub fn push_spec(&mut self, spec: LayerSpec) -> Result<&mut Self> {
        self.push(spec.kind(), &spec.args())
    }

    pub fn extend(&mut self, other: &LayerConfig) -> Result<&mut Self> {
        self.append(&other.layers)
    }

    fn append(&mut self, specs: &[LayerSpec]) -> Result<&mut Self> {
        let mut layers = Vec::with_capacity(self.len() + specs.len());
        layers.extend_from_slice(&self.layers);
        layers.extend_from_slice(specs);
        check_markers(&layers)?;
        self.layers = layers;
        Ok(self)
    }

    /// The literal list repeated `n` times. Every copy gets its own slots.
    pub fn repeat(&self, n: usize) -> Result<LayerConfig> {
        let layers = self.layers.repeat(n);
        check_markers(&layers)?;
        Ok(LayerConfig { layers })
    }

    pub fn concat(configs: &[LayerConfig]) -> Result<LayerConfig> {
        let mut config = LayerConfig::new();
        for c in configs {
            config.extend(c)?;
        }
        Ok(config)
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LayerSpec> {
        self.layers.iter()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid config JSON: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::config(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

impl TryFrom<Vec<RawLayer>> for LayerConfig {
    type Error = Error;

    fn try_from(raw: Vec<RawLayer>) -> Result<Self> {
        LayerConfig::from_raw(&raw)
    }
}

impl From<LayerConfig> for Vec<RawLayer> {
    fn from(config: LayerConfig) -> Self {
        config.to_raw()
    }
}

impl<'a> IntoIterator for &'a LayerConfig {
    type Item = &'a LayerSpec;
    type IntoIter = std::slice::Iter<'a, LayerSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}

// Builders

fn conv(out_ch: usize, in_ch: usize, k: usize, stride: usize, pad: usize) -> LayerSpec {
    LayerSpec::Conv2d {
        out_ch,
        in_ch,
        kh: k,
        kw: k,
        stride,
        pad,
    }
}

fn relu() -> LayerSpec {
    LayerSpec::Relu { inplace: true }
}

fn bn(channels: usize) -> LayerSpec {
    LayerSpec::BatchNorm { channels }
}

fn max_pool(kernel: usize, stride: usize, pad: usize) -> LayerSpec {
    LayerSpec::MaxPool2d {
        kernel,
        stride,
        pad,
    }
}

fn block(out_ch: usize, in_ch: usize, stride: usize) -> LayerSpec {
    LayerSpec::BasicBlock {
        out_ch,
        in_ch,
        stride,
        expansion: 1,
    }
}

fn identity_in(channels: Option<usize>) -> LayerSpec {
    LayerSpec::IdentityIn { channels }
}

fn identity_out(channels: Option<usize>) -> LayerSpec {
    LayerSpec::IdentityOut { channels }
}

/// Four conv3x3 (no padding) / relu / bn / maxpool2 stages of 32 channels,
/// then flatten. On 84x84 RGB input the embedding is 32 * 3 * 3 = 288 wide.
pub fn conv4_no_classifier() -> LayerConfig {
    let stage = |in_ch| [conv(32, in_ch, 3, 1, 0), relu(), bn(32), max_pool(2, 2, 0)];
    let mut layers = stage(3).to_vec();
    for _ in 0..3 {
        layers.extend(stage(32));
    }
    layers.push(LayerSpec::Flatten);
    LayerConfig { layers }
}

/// The CNN4 backbone: four conv3x3 (pad 1) / bn / relu / maxpool2 stages of
/// `hidden` channels, then flatten.
pub fn conv4_backbone(hidden: usize) -> Result<LayerConfig> {
    let mut layers = Vec::with_capacity(17);
    let mut in_ch = 3;
    for _ in 0..4 {
        layers.extend([conv(hidden, in_ch, 3, 1, 1), bn(hidden), relu(), max_pool(2, 2, 0)]);
        in_ch = hidden;
    }
    layers.push(LayerSpec::Flatten);
    LayerConfig::from_layers(layers)
}

/// ResNet-18 feature extractor without classifier. 224x224 input gives a
/// 512-wide embedding.
pub fn resnet18_no_head() -> LayerConfig {
    let mut layers = vec![conv(64, 3, 7, 2, 3), bn(64), relu(), max_pool(3, 2, 1)];
    for _ in 0..2 {
        layers.extend([identity_in(None), block(64, 64, 1), block(64, 64, 1), identity_out(None)]);
    }
    for (in_ch, out_ch) in [(64, 128), (128, 256), (256, 512)] {
        layers.extend([
            identity_in(Some(in_ch)),
            block(out_ch, in_ch, 2),
            identity_out(Some(out_ch)),
            identity_in(None),
            block(out_ch, out_ch, 1),
            identity_out(None),
        ]);
    }
    layers.extend([
        LayerSpec::AvgPool2d {
            kernel: 7,
            stride: 1,
            pad: 0,
        },
        LayerSpec::Flatten,
    ]);
    LayerConfig { layers }
}

/// A single linear classifier `[num_ways, in_features]`.
pub fn classifier(num_ways: usize, in_features: usize) -> Result<LayerConfig> {
    LayerConfig::from_layers(vec![LayerSpec::Linear {
        out_features: num_ways,
        in_features,
    }])
}

/// ResNet-18 with a `num_ways` classifier.
pub fn resnet18(num_ways: usize) -> Result<LayerConfig> {
    let mut config = resnet18_no_head();
    config.extend(&classifier(num_ways, 512)?)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(v: &[i64]) -> Vec<Arg> {
        v.iter().map(|&i| Arg::Int(i)).collect()
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in LayerKind::ALL {
            assert_eq!(kind.as_str().parse::<LayerKind>().ok(), Some(kind));
        }
        assert!("conv3d".parse::<LayerKind>().is_err());
    }

    #[test]
    fn test_arity_is_checked() {
        assert!(LayerSpec::build(LayerKind::Conv2d, &ints(&[32, 3, 3, 3, 1])).is_err());
        assert!(LayerSpec::build(LayerKind::Flatten, &ints(&[1])).is_err());
        assert!(LayerSpec::build(LayerKind::IdentityIn, &ints(&[1, 2])).is_err());
        assert!(LayerSpec::build(LayerKind::Relu, &[]).is_ok());
    }

    #[test]
    fn test_argument_types_are_checked() {
        assert!(LayerSpec::build(LayerKind::BatchNorm, &[Arg::Float(32.0)]).is_err());
        assert!(LayerSpec::build(LayerKind::BatchNorm, &ints(&[-1])).is_err());
        assert!(LayerSpec::build(LayerKind::BatchNorm, &ints(&[0])).is_err());
        assert!(LayerSpec::build(LayerKind::Relu, &ints(&[1])).is_err());
        assert!(LayerSpec::build(LayerKind::BasicBlock, &ints(&[64, 64, 1, 4])).is_err());
    }

    #[test]
    fn test_args_roundtrip_through_build() -> Result<()> {
        for spec in resnet18(5)?.iter().chain(conv4_no_classifier().iter()) {
            assert_eq!(LayerSpec::build(spec.kind(), &spec.args()).ok(), Some(*spec));
        }
        Ok(())
    }

    #[test]
    fn test_builders_pass_validation() -> Result<()> {
        for config in [conv4_no_classifier(), resnet18_no_head(), conv4_backbone(64)?] {
            assert_eq!(LayerConfig::from_layers(config.layers().to_vec())?, config);
        }
        assert!(classifier(0, 512).is_err());
        assert!(conv4_backbone(0).is_err());
        Ok(())
    }

    #[test]
    fn test_builder_lengths() -> Result<()> {
        // 4 stages of 4 entries + flatten
        assert_eq!(conv4_no_classifier().len(), 17);
        assert_eq!(conv4_backbone(64)?.len(), 17);
        // stem 4, layer1 8, three stages of 6, avgpool + flatten
        assert_eq!(resnet18_no_head().len(), 4 + 8 + 18 + 2);
        assert_eq!(resnet18(5)?.len(), resnet18_no_head().len() + 1);
        Ok(())
    }

    #[test]
    fn test_repeat_is_literal() -> Result<()> {
        let block = LayerConfig::new()
            .with(LayerKind::Relu, &[Arg::Bool(true)])?
            .with(LayerKind::Flatten, &[])?;
        let r = block.repeat(3)?;
        assert_eq!(r.len(), 6);
        assert_eq!(r.layers()[4], block.layers()[0]);
        Ok(())
    }

    #[test]
    fn test_one_sided_projection_fails_when_parsed() {
        for json in [
            r#"[["identity_in", [4]], ["relu", []], ["identity_out", []]]"#,
            r#"[["identity_in", []], ["relu", []], ["identity_out", [4]]]"#,
            r#"[["relu", []], ["identity_out", [4]]]"#,
        ] {
            assert!(matches!(LayerConfig::from_json(json), Err(Error::Config(_))), "{}", json);
        }
        // plain unmatched markers are reported by the executor instead
        assert!(LayerConfig::from_json(r#"[["identity_out", []]]"#).is_ok());
    }

    #[test]
    fn test_one_sided_projection_fails_when_pushed() -> Result<()> {
        let mut config = LayerConfig::new().with(LayerKind::IdentityIn, &[Arg::Int(4)])?;
        assert!(matches!(
            config.push(LayerKind::IdentityOut, &[]),
            Err(Error::Config(_))
        ));
        assert_eq!(config.len(), 1);
        let tail = LayerConfig::new().with(LayerKind::IdentityOut, &[])?;
        assert!(config.extend(&tail).is_err());
        assert!(LayerConfig::concat(&[config.clone(), tail]).is_err());
        config.push(LayerKind::IdentityOut, &[Arg::Int(8)])?;
        assert_eq!(config.len(), 2);
        Ok(())
    }

    #[test]
    fn test_typed_specs_are_rechecked() {
        let wide_block = LayerSpec::BasicBlock {
            out_ch: 64,
            in_ch: 64,
            stride: 1,
            expansion: 2,
        };
        assert!(matches!(
            LayerConfig::from_layers(vec![wide_block]),
            Err(Error::Config(_))
        ));
        assert!(LayerConfig::new()
            .push_spec(LayerSpec::BatchNorm { channels: 0 })
            .is_err());
        assert!(LayerConfig::from_layers(vec![LayerSpec::Linear {
            out_features: 5,
            in_features: 0,
        }])
        .is_err());
    }
}
