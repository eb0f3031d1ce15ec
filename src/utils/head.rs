use crate::error::{shape_mismatch, NetError, Result};
use crate::utils::mat::Scalar;
use ndarray::{Array2, Axis};

/// One label per sample, each below `num_classes`.
pub fn check_labels(labels: &[usize], n: usize, num_classes: usize) -> Result<()> {
    if n == 0 {
        return Err(NetError::EmptyBatch);
    }
    if labels.len() != n {
        return Err(shape_mismatch("labels", n, labels.len()));
    }
    match labels.iter().find(|&&label| label >= num_classes) {
        Some(&label) => Err(NetError::LabelOutOfRange { label, num_classes }),
        None => Ok(()),
    }
}

/// Mean softmax cross-entropy over the batch, and its gradient w.r.t. scores.
pub fn softmax_loss<A: Scalar>(scores: &Array2<A>, labels: &[usize]) -> Result<(A, Array2<A>)> {
    let (n, num_classes) = scores.dim();
    check_labels(labels, n, num_classes)?;

    let mut grad = scores.to_owned();
    let mut loss = A::zero();
    for (mut row, &label) in grad.axis_iter_mut(Axis(0)).zip(labels) {
        let max_val = row.fold(A::neg_infinity(), |a, &b| a.max(b));
        let shifted = row[label] - max_val;
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum = row.sum();
        // log p[label] = (s - max) - ln(sum(exp(s - max)))
        loss -= shifted - sum.ln();
        row /= sum;
        row[label] -= A::one();
    }
    let batch = A::of(n as f64);
    grad /= batch;
    Ok((loss / batch, grad))
}

/// Index of the highest score in each row.
pub fn predict_labels<A: Scalar>(scores: &Array2<A>) -> Vec<usize> {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, A::neg_infinity()), |a, (i, &v)| if a.1 < v { (i, v) } else { a })
                .0
        })
        .collect()
}
