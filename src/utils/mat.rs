use crate::config::Precision;
use crate::error::Result;
use ndarray::{Array, Array2, Array4, Dimension, ScalarOperand, ShapeBuilder};
use ndarray_rand::RandomExt;
use num_traits::{Float, FromPrimitive};
use rand::Rng;
use rand_distr::StandardNormal;
use std::fmt::{Debug, Display};
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

/// Element type a network can be instantiated with.
pub trait Scalar:
    Float
    + FromPrimitive
    + ScalarOperand
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Debug
    + Display
    + Send
    + Sync
    + 'static
{
    const PRECISION: Precision;

    fn of(value: f64) -> Self;

    fn to_f64_lossy(self) -> f64;
}

impl Scalar for f32 {
    const PRECISION: Precision = Precision::F32;

    fn of(value: f64) -> Self {
        value as f32
    }

    fn to_f64_lossy(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    const PRECISION: Precision = Precision::F64;

    fn of(value: f64) -> Self {
        value
    }

    fn to_f64_lossy(self) -> f64 {
        self
    }
}

/// Draws every entry from N(0, 1) in f64, scales it, then casts to `A`.
/// Sampling in a fixed precision keeps f32 and f64 nets built from the same
/// seed numerically identical up to rounding.
pub fn gaussian<A, D, Sh, R>(shape: Sh, scale: f64, rng: &mut R) -> Array<A, D>
where
    A: Scalar,
    D: Dimension,
    Sh: ShapeBuilder<Dim = D>,
    R: Rng + ?Sized,
{
    Array::<f64, D>::random_using(shape, StandardNormal, rng).mapv(|v| A::of(v * scale))
}

// N*C*H*W => N*(CHW)
pub fn flatten<A: Scalar>(x: &Array4<A>) -> Result<Array2<A>> {
    let (n, c, h, w) = x.dim();
    Ok(x.to_shape((n, c * h * w))?.into_owned())
}

// N*(CHW) => N*C*H*W
pub fn unflatten<A: Scalar>(x: &Array2<A>, dim: (usize, usize, usize, usize)) -> Result<Array4<A>> {
    Ok(x.to_shape(dim)?.into_owned())
}

/// `0.5 * reg * sum(w^2)`
pub fn l2_penalty<A: Scalar, D: Dimension>(w: &Array<A, D>, reg: A) -> A {
    let sq = w.iter().fold(A::zero(), |acc, &v| acc + v * v);
    A::of(0.5) * reg * sq
}

/// Adds `reg * w` onto a raw weight gradient.
pub fn with_l2<A: Scalar, D: Dimension>(mut raw: Array<A, D>, w: &Array<A, D>, reg: A) -> Array<A, D> {
    raw.scaled_add(reg, w);
    raw
}
