use crate::error::{shape_mismatch, NetError, Result};
use crate::utils::mat::Scalar;
use crate::utils::nn_trait::{Classifier, ParamSet};
use ndarray::{Array4, ArrayBase, ArrayD, ArrayViewD, Data, Dimension};

pub fn ensure_finite<A, S, D>(what: &'static str, x: &ArrayBase<S, D>) -> Result<()>
where
    A: Scalar,
    S: Data<Elem = A>,
    D: Dimension,
{
    if x.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(NetError::NonFinite(what))
    }
}

/// Max over elements of `|a - b| / max(floor, |a| + |b|)`.
pub fn rel_error_with_floor<A: Scalar>(a: ArrayViewD<A>, b: ArrayViewD<A>, floor: f64) -> Result<f64> {
    if a.shape() != b.shape() {
        return Err(shape_mismatch("rel_error", a.shape(), b.shape()));
    }
    Ok(a.iter().zip(b.iter()).fold(0.0, |worst, (&x, &y)| {
        let (x, y) = (x.to_f64_lossy(), y.to_f64_lossy());
        let err = (x - y).abs() / floor.max(x.abs() + y.abs());
        worst.max(err)
    }))
}

pub fn rel_error<A: Scalar>(a: ArrayViewD<A>, b: ArrayViewD<A>) -> Result<f64> {
    rel_error_with_floor(a, b, 1e-8)
}

// Rewrites one entry of a named parameter and returns its previous value.
fn update_entry<A, P, F>(params: &mut P, name: &str, idx: usize, f: F) -> Result<A>
where
    A: Scalar,
    P: ParamSet<A>,
    F: FnOnce(A) -> A,
{
    let mut view = params
        .get_mut(name)
        .ok_or_else(|| NetError::UnknownParameter(name.to_string()))?;
    let slot = view
        .iter_mut()
        .nth(idx)
        .ok_or_else(|| NetError::UnknownParameter(format!("{}[{}]", name, idx)))?;
    let old = *slot;
    *slot = f(old);
    Ok(old)
}

/// Central-difference estimate of d loss / d params[name], one entry at a time.
///
/// The losses are evaluated on a scratch copy, so `net` keeps its parameters
/// and any running statistics the loss would otherwise update.
pub fn eval_numerical_gradient<A, C>(
    net: &C,
    x: &Array4<A>,
    labels: &[usize],
    name: &str,
    h: A,
) -> Result<ArrayD<A>>
where
    A: Scalar,
    C: Classifier<A> + Clone,
{
    let shape = net
        .params()
        .get(name)
        .ok_or_else(|| NetError::UnknownParameter(name.to_string()))?
        .raw_dim();
    let mut scratch = net.clone();
    let mut grad = ArrayD::zeros(shape);
    let two = A::of(2.0);
    for (idx, g) in grad.iter_mut().enumerate() {
        let original = update_entry(scratch.params_mut(), name, idx, |v| v + h)?;
        let (plus, _) = scratch.loss(x, labels)?;
        update_entry(scratch.params_mut(), name, idx, |_| original - h)?;
        let (minus, _) = scratch.loss(x, labels)?;
        update_entry(scratch.params_mut(), name, idx, |_| original)?;

        *g = (plus - minus) / (two * h);
    }
    Ok(grad)
}
