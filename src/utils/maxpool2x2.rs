use crate::error::{shape_mismatch, NetError, Result};
use crate::utils::mat::Scalar;
use ndarray::{s, stack, Array3, Array4, ArrayView3, Axis, Zip};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParam {
    pub pool_height: usize,
    pub pool_width: usize,
    pub stride: usize,
}

impl Default for PoolParam {
    // 2x2 window, stride 2
    fn default() -> Self {
        Self {
            pool_height: 2,
            pool_width: 2,
            stride: 2,
        }
    }
}

impl PoolParam {
    pub fn output_size(&self, (h, w): (usize, usize)) -> Option<(usize, usize)> {
        if self.stride == 0 || self.pool_height == 0 || self.pool_width == 0 {
            return None;
        }
        if h < self.pool_height || w < self.pool_width {
            return None;
        }
        Some((
            (h - self.pool_height) / self.stride + 1,
            (w - self.pool_width) / self.stride + 1,
        ))
    }
}

pub struct PoolCache {
    x_dim: (usize, usize, usize, usize),
    /// Row-major offset of the max inside each window
    max_mask: Array4<usize>,
    param: PoolParam,
}

fn pool_single<A: Scalar>(
    img: ArrayView3<A>,
    param: PoolParam,
    (ho, wo): (usize, usize),
) -> (Array3<A>, Array3<usize>) {
    let c = img.dim().0;
    let mut out = Array3::zeros((c, ho, wo));
    let mut mask = Array3::zeros((c, ho, wo));
    for ch in 0..c {
        for oy in 0..ho {
            for ox in 0..wo {
                let (y, x) = (oy * param.stride, ox * param.stride);
                let window = img.slice(s![ch, y..y + param.pool_height, x..x + param.pool_width]);
                // first maximum wins; a NaN anywhere in the window propagates
                let (arg, max) = window
                    .iter()
                    .enumerate()
                    .skip(1)
                    .fold((0, window[[0, 0]]), |best, (i, &v)| {
                        if v > best.1 || (v.is_nan() && !best.1.is_nan()) {
                            (i, v)
                        } else {
                            best
                        }
                    });
                out[[ch, oy, ox]] = max;
                mask[[ch, oy, ox]] = arg;
            }
        }
    }
    (out, mask)
}

pub fn max_pool_forward<A: Scalar>(x: &Array4<A>, param: PoolParam) -> Result<(Array4<A>, PoolCache)> {
    let (n, _, h, w) = x.dim();
    if n == 0 {
        return Err(NetError::EmptyBatch);
    }
    if param.stride == 0 {
        return Err(NetError::InvalidConfig("pool stride must be positive".into()));
    }
    let (ho, wo) = param
        .output_size((h, w))
        .ok_or_else(|| shape_mismatch("max_pool_forward", (param.pool_height, param.pool_width), (h, w)))?;

    let pooled: Vec<(Array3<A>, Array3<usize>)> = (0..n)
        .into_par_iter()
        .map(|i| pool_single(x.index_axis(Axis(0), i), param, (ho, wo)))
        .collect();
    let outs: Vec<_> = pooled.iter().map(|(out, _)| out.view()).collect();
    let masks: Vec<_> = pooled.iter().map(|(_, mask)| mask.view()).collect();

    Ok((
        stack(Axis(0), &outs)?,
        PoolCache {
            x_dim: x.dim(),
            max_mask: stack(Axis(0), &masks)?,
            param,
        },
    ))
}

pub fn max_pool_backward<A: Scalar>(dout: &Array4<A>, cache: PoolCache) -> Result<Array4<A>> {
    if dout.dim() != cache.max_mask.dim() {
        return Err(shape_mismatch("max_pool_backward", cache.max_mask.dim(), dout.dim()));
    }
    let PoolParam {
        pool_width, stride, ..
    } = cache.param;
    let mut dx = Array4::zeros(cache.x_dim);
    Zip::indexed(dout)
        .and(&cache.max_mask)
        .for_each(|(i, ch, oy, ox), &d, &arg| {
            let y = oy * stride + arg / pool_width;
            let x = ox * stride + arg % pool_width;
            dx[[i, ch, y, x]] += d;
        });
    Ok(dx)
}
