// Classification metrics on host data.

use fsl_core::{Backend, Error, Result, Tensor};

/// Fraction of positions where `predictions[i] == targets[i]`.
pub fn accuracy(predictions: &[usize], targets: &[usize]) -> f64 {
    if predictions.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(targets)
        .filter(|(p, t)| p == t)
        .count();
    correct as f64 / predictions.len() as f64
}

/// Row-wise argmax of `[batch, classes]` logits. Ties go to the lower index.
pub fn argmax_classes<B: Backend>(logits: &Tensor<B>) -> Result<Vec<usize>> {
    if logits.rank() != 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: logits.rank(),
        });
    }
    let classes = logits.dims()[1];
    if classes == 0 {
        return Err(Error::msg("argmax_classes: zero classes"));
    }
    let data = logits.to_f64_vec()?;
    Ok(data
        .chunks(classes)
        .map(|row| {
            let mut best = 0;
            for (i, &v) in row.iter().enumerate() {
                if v > row[best] {
                    best = i;
                }
            }
            best
        })
        .collect())
}

/// Accuracy of `[batch, classes]` logits against integer labels.
pub fn logits_accuracy<B: Backend>(logits: &Tensor<B>, labels: &[usize]) -> Result<f64> {
    let predicted = argmax_classes(logits)?;
    if predicted.len() != labels.len() {
        return Err(Error::msg(format!(
            "logits_accuracy: {} predictions for {} labels",
            predicted.len(),
            labels.len()
        )));
    }
    Ok(accuracy(&predicted, labels))
}
