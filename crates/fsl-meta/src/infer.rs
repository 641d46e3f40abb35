// Symbolic shape propagation
//
// Walks a config with dimension lists instead of tensors. The executor runs
// this before touching any data, so a declared channel, kernel or identity
// marker that does not fit the input fails here with the same error the
// forward pass would raise, and no partial computation happens.

use fsl_core::Window;

use crate::config::{LayerConfig, LayerSpec};
use crate::error::{Error, Result};

fn shape_err(layer: usize, spec: &LayerSpec, msg: String) -> Error {
    Error::Shape {
        layer,
        kind: spec.kind().as_str(),
        msg,
    }
}

fn expect_image(layer: usize, spec: &LayerSpec, dims: &[usize]) -> Result<[usize; 4]> {
    match dims {
        &[n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(shape_err(
            layer,
            spec,
            format!("expected [N, C, H, W] activation, got {:?}", dims),
        )),
    }
}

fn expect_channels(layer: usize, spec: &LayerSpec, got: usize, declared: usize) -> Result<()> {
    if got != declared {
        return Err(shape_err(
            layer,
            spec,
            format!("declared {} input channels, activation has {}", declared, got),
        ));
    }
    Ok(())
}

fn window_out(layer: usize, spec: &LayerSpec, window: Window, hw: [usize; 2]) -> Result<[usize; 2]> {
    window.output_size(hw).ok_or_else(|| {
        shape_err(
            layer,
            spec,
            format!(
                "kernel {:?} with padding {:?} does not fit {:?}",
                window.kernel, window.padding, hw
            ),
        )
    })
}

/// Smallest stride `s` such that a 1x1 conv with stride `s` maps `from` onto
/// `to` spatially.
pub fn projection_stride(from: [usize; 2], to: [usize; 2]) -> Option<usize> {
    let limit = from[0].max(from[1]).max(1);
    (1..=limit).find(|&s| {
        from[0] > 0
            && from[1] > 0
            && (from[0] - 1) / s + 1 == to[0]
            && (from[1] - 1) / s + 1 == to[1]
    })
}

/// Output dims of one layer. `stack` holds `(layer, declared_in, dims)` of the
/// open identity_in markers.
pub(crate) fn step_dims(
    layer: usize,
    spec: &LayerSpec,
    dims: &[usize],
    stack: &mut Vec<(usize, Option<usize>, Vec<usize>)>,
) -> Result<Vec<usize>> {
    let out = match *spec {
        LayerSpec::Conv2d {
            out_ch,
            in_ch,
            kh,
            kw,
            stride,
            pad,
        } => {
            let [n, c, h, w] = expect_image(layer, spec, dims)?;
            expect_channels(layer, spec, c, in_ch)?;
            let window = Window::new([kh, kw], [stride, stride], [pad, pad]);
            let [ho, wo] = window_out(layer, spec, window, [h, w])?;
            vec![n, out_ch, ho, wo]
        }
        LayerSpec::Relu { .. } => dims.to_vec(),
        LayerSpec::BatchNorm { channels } => {
            let [_, c, _, _] = expect_image(layer, spec, dims)?;
            expect_channels(layer, spec, c, channels)?;
            dims.to_vec()
        }
        LayerSpec::MaxPool2d {
            kernel,
            stride,
            pad,
        }
        | LayerSpec::AvgPool2d {
            kernel,
            stride,
            pad,
        } => {
            let [n, c, h, w] = expect_image(layer, spec, dims)?;
            let [ho, wo] = window_out(layer, spec, Window::square(kernel, stride, pad), [h, w])?;
            vec![n, c, ho, wo]
        }
        LayerSpec::Flatten => {
            if dims.len() < 2 {
                return Err(shape_err(
                    layer,
                    spec,
                    format!("cannot flatten activation {:?}", dims),
                ));
            }
            vec![dims[0], dims[1..].iter().product()]
        }
        LayerSpec::Linear {
            out_features,
            in_features,
        } => match dims {
            &[n, f] if f == in_features => vec![n, out_features],
            _ => {
                return Err(shape_err(
                    layer,
                    spec,
                    format!("expected [N, {}] activation, got {:?}", in_features, dims),
                ))
            }
        },
        LayerSpec::BasicBlock {
            out_ch,
            in_ch,
            stride,
            ..
        } => {
            let [n, c, h, w] = expect_image(layer, spec, dims)?;
            expect_channels(layer, spec, c, in_ch)?;
            let [ho, wo] = window_out(layer, spec, Window::square(3, stride, 1), [h, w])?;
            vec![n, out_ch, ho, wo]
        }
        LayerSpec::IdentityIn { channels } => {
            if let Some(declared) = channels {
                let [_, c, _, _] = expect_image(layer, spec, dims)?;
                expect_channels(layer, spec, c, declared)?;
            }
            stack.push((layer, channels, dims.to_vec()));
            dims.to_vec()
        }
        LayerSpec::IdentityOut { channels } => {
            let (_, declared_in, stashed) = stack.pop().ok_or_else(|| Error::UnmatchedIdentity {
                layer,
                msg: "identity_out without a preceding identity_in".into(),
            })?;
            match (declared_in, channels) {
                (Some(_), Some(out_ch)) => {
                    let [sn, _, sh, sw] = expect_image(layer, spec, &stashed)?;
                    let [n, c, h, w] = expect_image(layer, spec, dims)?;
                    if c != out_ch || sn != n {
                        return Err(shape_err(
                            layer,
                            spec,
                            format!(
                                "projection to {} channels cannot match activation {:?}",
                                out_ch, dims
                            ),
                        ));
                    }
                    if projection_stride([sh, sw], [h, w]).is_none() {
                        return Err(shape_err(
                            layer,
                            spec,
                            format!(
                                "no 1x1 projection stride maps {:?} onto {:?}",
                                [sh, sw],
                                [h, w]
                            ),
                        ));
                    }
                }
                _ => {
                    if stashed != dims {
                        return Err(shape_err(
                            layer,
                            spec,
                            format!(
                                "skip activation {:?} does not match {:?} and no projection is declared",
                                stashed, dims
                            ),
                        ));
                    }
                }
            }
            dims.to_vec()
        }
    };
    Ok(out)
}

/// Fail if any identity_in is still open at the end of the config.
pub(crate) fn check_closed(stack: &[(usize, Option<usize>, Vec<usize>)]) -> Result<()> {
    match stack.last() {
        Some((layer, _, _)) => Err(Error::UnmatchedIdentity {
            layer: *layer,
            msg: "identity_in is never closed by an identity_out".into(),
        }),
        None => Ok(()),
    }
}

impl LayerConfig {
    /// Output dims of every layer for an input of `input_dims`.
    pub fn infer_shapes(&self, input_dims: &[usize]) -> Result<Vec<Vec<usize>>> {
        let mut stack = Vec::new();
        let mut dims = input_dims.to_vec();
        let mut out = Vec::with_capacity(self.len());
        for (i, spec) in self.iter().enumerate() {
            dims = step_dims(i, spec, &dims, &mut stack)?;
            out.push(dims.clone());
        }
        check_closed(&stack)?;
        Ok(out)
    }

    /// Final output dims for `input_dims`.
    pub fn output_dims(&self, input_dims: &[usize]) -> Result<Vec<usize>> {
        Ok(self
            .infer_shapes(input_dims)?
            .pop()
            .unwrap_or_else(|| input_dims.to_vec()))
    }

    /// Width of the `[N, D]` embedding this config produces.
    pub fn embed_dim(&self, input_dims: &[usize]) -> Result<usize> {
        match self.output_dims(input_dims)?.as_slice() {
            &[_, d] => Ok(d),
            other => Err(Error::config(format!(
                "config produces {:?}, not a flat [N, D] embedding",
                other
            ))),
        }
    }
}
