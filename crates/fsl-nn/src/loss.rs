// Loss functions
//
// Every loss returns a scalar tensor so `backward()` applies directly, and
// every loss is built from differentiable ops only, so the gradient of a loss
// can itself be differentiated (inner-loop updates in meta-learning).

use fsl_core::{Backend, DType, Error, Result, Tensor};

/// One-hot encode class indices into a `[labels.len(), num_classes]` tensor.
pub fn one_hot<B: Backend>(
    labels: &[usize],
    num_classes: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let mut data = vec![0.0f64; labels.len() * num_classes];
    for (row, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(Error::msg(format!(
                "one_hot: label {} out of range for {} classes",
                label, num_classes
            )));
        }
        data[row * num_classes + label] = 1.0;
    }
    Tensor::<B>::from_f64_slice(&data, (labels.len(), num_classes), dtype, device)
}

/// Cross-entropy between logits `[batch, classes]` and a target distribution
/// of the same shape (usually one-hot): `-mean(sum(target * log_softmax))`.
pub fn cross_entropy_loss<B: Backend>(logits: &Tensor<B>, target: &Tensor<B>) -> Result<Tensor<B>> {
    if logits.rank() != 2 {
        return Err(Error::msg(format!(
            "cross_entropy expects 2D logits [batch, classes], got {:?}",
            logits.dims()
        )));
    }
    if logits.dims() != target.dims() {
        return Err(Error::ShapeMismatch {
            expected: logits.shape().clone(),
            got: target.shape().clone(),
        });
    }
    target
        .mul(&logits.log_softmax(1)?)?
        .sum(1, false)?
        .mean_all()?
        .neg()
}

/// Cross-entropy against integer class labels.
pub fn cross_entropy_with_labels<B: Backend>(
    logits: &Tensor<B>,
    labels: &[usize],
) -> Result<Tensor<B>> {
    if logits.rank() != 2 || logits.dims()[0] != labels.len() {
        return Err(Error::msg(format!(
            "cross_entropy: logits {:?} do not match {} labels",
            logits.dims(),
            labels.len()
        )));
    }
    let target = one_hot::<B>(labels, logits.dims()[1], logits.dtype(), logits.device())?;
    cross_entropy_loss(logits, &target)
}

/// Mean squared error: `mean((prediction - target)²)`.
pub fn mse_loss<B: Backend>(prediction: &Tensor<B>, target: &Tensor<B>) -> Result<Tensor<B>> {
    prediction.sub(target)?.square()?.mean_all()
}
