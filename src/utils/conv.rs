use crate::error::{shape_mismatch, NetError, Result};
use crate::utils::mat::Scalar;
use ndarray::{concatenate, s, stack, Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParam {
    pub stride: usize,
    pub pad: usize,
}

impl ConvParam {
    /// Stride 1 with `(filter_size - 1) / 2` zero padding, which preserves
    /// the spatial size for odd filters.
    pub fn same(filter_size: usize) -> Self {
        Self {
            stride: 1,
            pad: filter_size.saturating_sub(1) / 2,
        }
    }

    /// `None` when the filter does not fit inside the padded input.
    pub fn output_size(&self, (h, w): (usize, usize), (fh, fw): (usize, usize)) -> Option<(usize, usize)> {
        let hp = h + 2 * self.pad;
        let wp = w + 2 * self.pad;
        if self.stride == 0 || fh == 0 || fw == 0 || hp < fh || wp < fw {
            return None;
        }
        Some(((hp - fh) / self.stride + 1, (wp - fw) / self.stride + 1))
    }
}

pub struct ConvCache<A> {
    x_dim: (usize, usize, usize, usize),
    cols: Array2<A>,
    weight: Array4<A>,
    param: ConvParam,
}

// C*Hp*Wp => HoWo*(C*Fh*Fw)
fn im2col<A: Scalar>(
    img: ArrayView3<A>,
    (fh, fw): (usize, usize),
    stride: usize,
    (ho, wo): (usize, usize),
) -> Array2<A> {
    let c = img.dim().0;
    let mut cols = Array2::zeros((ho * wo, c * fh * fw));
    for oy in 0..ho {
        for ox in 0..wo {
            let (y, x) = (oy * stride, ox * stride);
            let patch = img.slice(s![.., y..y + fh, x..x + fw]);
            let mut row = cols.row_mut(oy * wo + ox);
            row.iter_mut().zip(patch.iter()).for_each(|(dst, src)| *dst = *src);
        }
    }
    cols
}

// HoWo*(C*Fh*Fw) => C*Hp*Wp, overlapping windows accumulate
fn col2im<A: Scalar>(
    dcols: ArrayView2<A>,
    (c, hp, wp): (usize, usize, usize),
    (fh, fw): (usize, usize),
    stride: usize,
    (ho, wo): (usize, usize),
) -> Array3<A> {
    let mut img = Array3::zeros((c, hp, wp));
    for oy in 0..ho {
        for ox in 0..wo {
            let (y, x) = (oy * stride, ox * stride);
            let row = dcols.row(oy * wo + ox);
            let mut patch = img.slice_mut(s![.., y..y + fh, x..x + fw]);
            patch.iter_mut().zip(row.iter()).for_each(|(dst, src)| *dst += *src);
        }
    }
    img
}

/// Convolution with bias: x (N, C, H, W), w (K, C, Fh, Fw), b (K).
pub fn conv_forward<A: Scalar>(
    x: &Array4<A>,
    w: &Array4<A>,
    b: &Array1<A>,
    param: ConvParam,
) -> Result<(Array4<A>, ConvCache<A>)> {
    let (n, c, h, wd) = x.dim();
    let (k, wc, fh, fw) = w.dim();
    if n == 0 {
        return Err(NetError::EmptyBatch);
    }
    if wc != c {
        return Err(shape_mismatch("conv_forward", ("_", wc, "_", "_"), x.dim()));
    }
    if b.len() != k {
        return Err(shape_mismatch("conv_forward", k, b.len()));
    }
    if param.stride == 0 {
        return Err(NetError::InvalidConfig("conv stride must be positive".into()));
    }
    let (ho, wo) = param
        .output_size((h, wd), (fh, fw))
        .ok_or_else(|| shape_mismatch("conv_forward", (fh, fw), (h, wd)))?;
    let pad = param.pad;
    let (hp, wp) = (h + 2 * pad, wd + 2 * pad);

    let mut padded = Array4::zeros((n, c, hp, wp));
    padded.slice_mut(s![.., .., pad..pad + h, pad..pad + wd]).assign(x);

    let blocks: Vec<Array2<A>> = (0..n)
        .into_par_iter()
        .map(|i| im2col(padded.index_axis(Axis(0), i), (fh, fw), param.stride, (ho, wo)))
        .collect();
    let views: Vec<_> = blocks.iter().map(|block| block.view()).collect();
    let cols = concatenate(Axis(0), &views)?;

    let w_mat = w.to_shape((k, c * fh * fw))?;
    let out = cols.dot(&w_mat.t()) + b;
    let out = out
        .to_shape((n, ho, wo, k))?
        .into_owned()
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned();

    Ok((
        out,
        ConvCache {
            x_dim: (n, c, h, wd),
            cols,
            weight: w.clone(),
            param,
        },
    ))
}

/// Returns (dx, dw, db).
pub fn conv_backward<A: Scalar>(
    dout: &Array4<A>,
    cache: ConvCache<A>,
) -> Result<(Array4<A>, Array4<A>, Array1<A>)> {
    let ConvCache {
        x_dim: (n, c, h, wd),
        cols,
        weight,
        param,
    } = cache;
    let (k, _, fh, fw) = weight.dim();
    let (dn, dk, ho, wo) = dout.dim();
    if dn != n || dk != k || cols.nrows() != n * ho * wo {
        return Err(shape_mismatch("conv_backward", (n, k), (dn, dk, ho, wo)));
    }
    let pad = param.pad;
    let (hp, wp) = (h + 2 * pad, wd + 2 * pad);

    // N*K*Ho*Wo => NHoWo*K
    let nhwc = dout.view().permuted_axes([0, 2, 3, 1]);
    let dout_mat = nhwc.to_shape((n * ho * wo, k))?;

    let db = dout_mat.sum_axis(Axis(0));
    let dw = dout_mat.t().dot(&cols).to_shape((k, c, fh, fw))?.into_owned();
    let w_mat = weight.to_shape((k, c * fh * fw))?;
    let dcols = dout_mat.dot(&w_mat);

    let block = ho * wo;
    let images: Vec<Array3<A>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let rows = dcols.slice(s![i * block..(i + 1) * block, ..]);
            col2im(rows, (c, hp, wp), (fh, fw), param.stride, (ho, wo))
                .slice(s![.., pad..pad + h, pad..pad + wd])
                .to_owned()
        })
        .collect();
    let views: Vec<_> = images.iter().map(|img| img.view()).collect();
    let dx = stack(Axis(0), &views)?;

    Ok((dx, dw, db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array};

    fn naive_conv(x: &Array4<f64>, w: &Array4<f64>, b: &Array1<f64>, p: ConvParam) -> Array4<f64> {
        let (n, c, h, wd) = x.dim();
        let (k, _, fh, fw) = w.dim();
        let (ho, wo) = p.output_size((h, wd), (fh, fw)).unwrap();
        let mut out = Array4::zeros((n, k, ho, wo));
        for i in 0..n {
            for f in 0..k {
                for oy in 0..ho {
                    for ox in 0..wo {
                        let mut acc = b[f];
                        for ch in 0..c {
                            for ky in 0..fh {
                                for kx in 0..fw {
                                    let y = (oy * p.stride + ky) as isize - p.pad as isize;
                                    let xx = (ox * p.stride + kx) as isize - p.pad as isize;
                                    if y >= 0 && xx >= 0 && (y as usize) < h && (xx as usize) < wd {
                                        acc += x[[i, ch, y as usize, xx as usize]] * w[[f, ch, ky, kx]];
                                    }
                                }
                            }
                        }
                        out[[i, f, oy, ox]] = acc;
                    }
                }
            }
        }
        out
    }

    fn ramp(shape: (usize, usize, usize, usize), step: f64) -> Array4<f64> {
        let len = shape.0 * shape.1 * shape.2 * shape.3;
        Array::range(0.0, len as f64, 1.0)
            .mapv(|v| (v * step).sin())
            .into_shape(shape)
            .unwrap()
    }

    #[test]
    fn test_output_size() {
        assert_eq!(ConvParam::same(3).output_size((16, 16), (3, 3)), Some((16, 16)));
        assert_eq!(ConvParam::same(7).output_size((32, 32), (7, 7)), Some((32, 32)));
        let p = ConvParam { stride: 2, pad: 1 };
        assert_eq!(p.output_size((5, 7), (3, 3)), Some((3, 4)));
        assert_eq!(ConvParam { stride: 1, pad: 0 }.output_size((2, 2), (3, 3)), None);
    }

    #[test]
    fn test_conv_forward_matches_naive() {
        let x = ramp((2, 3, 5, 6), 0.37);
        let w = ramp((4, 3, 3, 3), 0.91);
        let b = arr1(&[0.1, -0.2, 0.3, 0.0]);
        for p in [ConvParam::same(3), ConvParam { stride: 2, pad: 1 }, ConvParam { stride: 1, pad: 0 }] {
            let (out, _) = conv_forward(&x, &w, &b, p).unwrap();
            let expected = naive_conv(&x, &w, &b, p);
            assert_eq!(out.dim(), expected.dim());
            for (a, e) in out.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*a, *e, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_conv_backward_matches_numerical() {
        let x = ramp((2, 2, 4, 5), 0.53);
        let w = ramp((3, 2, 3, 3), 0.29);
        let b = arr1(&[0.05, -0.1, 0.2]);
        let p = ConvParam { stride: 1, pad: 1 };
        let (out, cache) = conv_forward(&x, &w, &b, p).unwrap();
        let dout = ramp(out.dim(), 0.71);
        let (dx, dw, db) = conv_backward(&dout, cache).unwrap();
        assert_eq!(dx.dim(), x.dim());
        assert_eq!(dw.dim(), w.dim());

        // d(sum(out * dout))/dparam by central differences
        let objective = |x: &Array4<f64>, w: &Array4<f64>, b: &Array1<f64>| {
            (naive_conv(x, w, b, p) * &dout).sum()
        };
        let h = 1e-6;
        for idx in [[0, 0, 0, 0], [1, 1, 3, 4], [0, 1, 2, 2]] {
            let mut xp = x.clone();
            xp[idx] += h;
            let mut xm = x.clone();
            xm[idx] -= h;
            let num = (objective(&xp, &w, &b) - objective(&xm, &w, &b)) / (2.0 * h);
            assert_abs_diff_eq!(dx[idx], num, epsilon = 1e-6);
        }
        for idx in [[0, 0, 0, 0], [2, 1, 2, 1], [1, 0, 1, 2]] {
            let mut wp = w.clone();
            wp[idx] += h;
            let mut wm = w.clone();
            wm[idx] -= h;
            let num = (objective(&x, &wp, &b) - objective(&x, &wm, &b)) / (2.0 * h);
            assert_abs_diff_eq!(dw[idx], num, epsilon = 1e-6);
        }
        for f in 0..3 {
            assert_abs_diff_eq!(db[f], dout.index_axis(Axis(1), f).sum(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_conv_empty_batch() {
        let x = Array4::<f64>::zeros((0, 2, 4, 4));
        let w = Array4::<f64>::zeros((3, 2, 3, 3));
        let b = Array1::<f64>::zeros(3);
        assert!(matches!(
            conv_forward(&x, &w, &b, ConvParam::same(3)),
            Err(NetError::EmptyBatch)
        ));
    }

    #[test]
    fn test_conv_channel_mismatch() {
        let x = Array4::<f64>::zeros((1, 2, 4, 4));
        let w = Array4::<f64>::zeros((3, 1, 3, 3));
        let b = Array1::<f64>::zeros(3);
        assert!(conv_forward(&x, &w, &b, ConvParam::same(3)).is_err());
    }
}
