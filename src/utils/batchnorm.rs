//! Batch normalization over the batch axis of an (N, D) activation, plus a
//! spatial variant for (N, C, H, W) that normalizes each channel over N*H*W.
//!
//! Training mode normalizes with the batch mean and biased variance and folds
//! them into the running statistics:
//!
//! ```text
//! running_mean = momentum * running_mean + (1 - momentum) * mean
//! running_var  = momentum * running_var  + (1 - momentum) * var
//! ```
//!
//! Inference mode normalizes with the running statistics and leaves them alone.

use crate::error::{shape_mismatch, NetError, Result};
use crate::utils::mat::Scalar;
use ndarray::{Array1, Array2, Array4, Axis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Training,
    Inference,
}

/// Per-site normalization state owned by the classifier.
#[derive(Debug, Clone)]
pub struct BatchNormState<A> {
    pub mode: Mode,
    pub eps: A,
    pub momentum: A,
    pub running_mean: Array1<A>,
    pub running_var: Array1<A>,
}

impl<A: Scalar> BatchNormState<A> {
    pub fn new(size: usize, eps: A, momentum: A) -> Self {
        Self {
            mode: Mode::Training,
            eps,
            momentum,
            running_mean: Array1::zeros(size),
            running_var: Array1::zeros(size),
        }
    }

    pub fn size(&self) -> usize {
        self.running_mean.len()
    }
}

pub struct BatchNormCache<A> {
    mode: Mode,
    x_hat: Array2<A>,
    std: Array1<A>,
    gamma: Array1<A>,
}

pub fn batchnorm_forward<A: Scalar>(
    x: &Array2<A>,
    gamma: &Array1<A>,
    beta: &Array1<A>,
    state: &mut BatchNormState<A>,
) -> Result<(Array2<A>, BatchNormCache<A>)> {
    let d = x.ncols();
    if gamma.len() != d || beta.len() != d || state.size() != d {
        return Err(shape_mismatch(
            "batchnorm_forward",
            (gamma.len(), beta.len(), state.size()),
            x.dim(),
        ));
    }

    let (x_hat, std) = match state.mode {
        Mode::Training => {
            let mean = x.mean_axis(Axis(0)).ok_or(NetError::EmptyBatch)?;
            let centered = x - &mean;
            let var = centered
                .mapv(|v| v * v)
                .mean_axis(Axis(0))
                .ok_or(NetError::EmptyBatch)?;
            let eps = state.eps;
            let std = var.mapv(|v| (v + eps).sqrt());
            let x_hat = centered / &std;

            let m = state.momentum;
            let keep = A::one() - m;
            state.running_mean = &state.running_mean * m + &mean * keep;
            state.running_var = &state.running_var * m + &var * keep;
            (x_hat, std)
        }
        Mode::Inference => {
            let eps = state.eps;
            let std = state.running_var.mapv(|v| (v + eps).sqrt());
            let x_hat = (x - &state.running_mean) / &std;
            (x_hat, std)
        }
    };

    let out = &x_hat * gamma + beta;
    Ok((
        out,
        BatchNormCache {
            mode: state.mode,
            x_hat,
            std,
            gamma: gamma.clone(),
        },
    ))
}

/// Returns (dx, dgamma, dbeta).
pub fn batchnorm_backward<A: Scalar>(
    dout: &Array2<A>,
    cache: BatchNormCache<A>,
) -> Result<(Array2<A>, Array1<A>, Array1<A>)> {
    let BatchNormCache {
        mode,
        x_hat,
        std,
        gamma,
    } = cache;
    if dout.dim() != x_hat.dim() {
        return Err(shape_mismatch("batchnorm_backward", x_hat.dim(), dout.dim()));
    }
    let dbeta = dout.sum_axis(Axis(0));
    let dgamma = (dout * &x_hat).sum_axis(Axis(0));
    let dx_hat = dout * &gamma;

    let dx = match mode {
        Mode::Training => {
            let n = A::of(x_hat.nrows() as f64);
            let sum_dx_hat = dx_hat.sum_axis(Axis(0));
            let sum_dx_hat_x_hat = (&dx_hat * &x_hat).sum_axis(Axis(0));
            // (N dx_hat - sum(dx_hat) - x_hat sum(dx_hat x_hat)) / (N std)
            let numer = dx_hat * n - &sum_dx_hat - &x_hat * &sum_dx_hat_x_hat;
            numer / &(&std * n)
        }
        // running statistics are constants w.r.t. x
        Mode::Inference => dx_hat / &std,
    };
    Ok((dx, dgamma, dbeta))
}

pub struct SpatialBatchNormCache<A> {
    x_dim: (usize, usize, usize, usize),
    inner: BatchNormCache<A>,
}

// N*C*H*W => NHW*C
fn channels_last<A: Scalar>(x: &Array4<A>) -> Result<Array2<A>> {
    let (n, c, h, w) = x.dim();
    let nhwc = x.view().permuted_axes([0, 2, 3, 1]);
    Ok(nhwc.to_shape((n * h * w, c))?.into_owned())
}

// NHW*C => N*C*H*W
fn channels_first<A: Scalar>(rows: &Array2<A>, (n, c, h, w): (usize, usize, usize, usize)) -> Result<Array4<A>> {
    Ok(rows
        .to_shape((n, h, w, c))?
        .into_owned()
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned())
}

pub fn spatial_batchnorm_forward<A: Scalar>(
    x: &Array4<A>,
    gamma: &Array1<A>,
    beta: &Array1<A>,
    state: &mut BatchNormState<A>,
) -> Result<(Array4<A>, SpatialBatchNormCache<A>)> {
    let rows = channels_last(x)?;
    let (out, inner) = batchnorm_forward(&rows, gamma, beta, state)?;
    Ok((
        channels_first(&out, x.dim())?,
        SpatialBatchNormCache { x_dim: x.dim(), inner },
    ))
}

pub fn spatial_batchnorm_backward<A: Scalar>(
    dout: &Array4<A>,
    cache: SpatialBatchNormCache<A>,
) -> Result<(Array4<A>, Array1<A>, Array1<A>)> {
    if dout.dim() != cache.x_dim {
        return Err(shape_mismatch("spatial_batchnorm_backward", cache.x_dim, dout.dim()));
    }
    let (dx, dgamma, dbeta) = batchnorm_backward(&channels_last(dout)?, cache.inner)?;
    Ok((channels_first(&dx, cache.x_dim)?, dgamma, dbeta))
}
