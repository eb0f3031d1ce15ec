use crate::error::{shape_mismatch, Result};
use crate::utils::mat::Scalar;
use ndarray::{Array, Dimension, Zip};

pub struct ReluCache<A, D: Dimension> {
    last_input: Array<A, D>,
}

pub fn relu_forward<A: Scalar, D: Dimension>(x: &Array<A, D>) -> (Array<A, D>, ReluCache<A, D>) {
    let out = x.mapv(|v| if v > A::zero() { v } else { A::zero() });
    (
        out,
        ReluCache {
            last_input: x.clone(),
        },
    )
}

pub fn relu_backward<A: Scalar, D: Dimension>(
    dout: &Array<A, D>,
    cache: ReluCache<A, D>,
) -> Result<Array<A, D>> {
    if dout.shape() != cache.last_input.shape() {
        return Err(shape_mismatch(
            "relu_backward",
            cache.last_input.shape(),
            dout.shape(),
        ));
    }
    let mut dx = dout.clone();
    Zip::from(&mut dx)
        .and(&cache.last_input)
        .for_each(|d, &x| {
            if x <= A::zero() {
                *d = A::zero();
            }
        });
    Ok(dx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_relu_forward_backward() {
        let x = arr2(&[[-1.0f32, 0.0, 2.0], [3.0, -0.5, 0.25]]);
        let (out, cache) = relu_forward(&x);
        assert_eq!(out, arr2(&[[0.0, 0.0, 2.0], [3.0, 0.0, 0.25]]));
        let dx = relu_backward(&arr2(&[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]]), cache).unwrap();
        assert_eq!(dx, arr2(&[[0.0, 0.0, 1.0], [2.0, 0.0, 2.0]]));
    }

    #[test]
    fn test_relu_shape_mismatch() {
        let (_, cache) = relu_forward(&arr1(&[1.0f64, 2.0]));
        assert!(relu_backward(&arr1(&[1.0, 2.0, 3.0]), cache).is_err());
    }
}
