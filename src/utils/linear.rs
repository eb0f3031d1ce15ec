use crate::error::{shape_mismatch, Result};
use crate::utils::mat::Scalar;
use ndarray::{Array1, Array2, Axis};

pub struct AffineCache<A> {
    last_input: Array2<A>,
    weight: Array2<A>,
}

/// x (N, D) · w (D, M) + b (M)
pub fn affine_forward<A: Scalar>(
    x: &Array2<A>,
    w: &Array2<A>,
    b: &Array1<A>,
) -> Result<(Array2<A>, AffineCache<A>)> {
    if x.ncols() != w.nrows() {
        return Err(shape_mismatch("affine_forward", w.nrows(), x.dim()));
    }
    if b.len() != w.ncols() {
        return Err(shape_mismatch("affine_forward", w.ncols(), b.len()));
    }
    let out = x.dot(w) + b;
    Ok((
        out,
        AffineCache {
            last_input: x.clone(),
            weight: w.clone(),
        },
    ))
}

/// Returns (dx, dw, db).
pub fn affine_backward<A: Scalar>(
    dout: &Array2<A>,
    cache: AffineCache<A>,
) -> Result<(Array2<A>, Array2<A>, Array1<A>)> {
    let AffineCache { last_input, weight } = cache;
    if dout.dim() != (last_input.nrows(), weight.ncols()) {
        return Err(shape_mismatch(
            "affine_backward",
            (last_input.nrows(), weight.ncols()),
            dout.dim(),
        ));
    }
    let db = dout.sum_axis(Axis(0));
    let dw = last_input.t().dot(dout);
    let dx = dout.dot(&weight.t());
    Ok((dx, dw, db))
}
