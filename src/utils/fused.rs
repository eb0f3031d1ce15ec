//! Layer sandwiches used by the classifiers. Each cache owns the caches of
//! its inner layers, and each backward consumes them in reverse order.

use crate::error::Result;
use crate::utils::batchnorm::{
    batchnorm_backward, batchnorm_forward, spatial_batchnorm_backward, spatial_batchnorm_forward,
    BatchNormCache, BatchNormState, SpatialBatchNormCache,
};
use crate::utils::conv::{conv_backward, conv_forward, ConvCache, ConvParam};
use crate::utils::linear::{affine_backward, affine_forward, AffineCache};
use crate::utils::mat::Scalar;
use crate::utils::maxpool2x2::{max_pool_backward, max_pool_forward, PoolCache, PoolParam};
use crate::utils::relu::{relu_backward, relu_forward, ReluCache};
use ndarray::{Array1, Array2, Array4, Ix2, Ix4};

pub struct ConvReluPoolCache<A> {
    conv: ConvCache<A>,
    relu: ReluCache<A, Ix4>,
    pool: PoolCache,
}

pub fn conv_relu_pool_forward<A: Scalar>(
    x: &Array4<A>,
    w: &Array4<A>,
    b: &Array1<A>,
    conv_param: ConvParam,
    pool_param: PoolParam,
) -> Result<(Array4<A>, ConvReluPoolCache<A>)> {
    let (a, conv) = conv_forward(x, w, b, conv_param)?;
    let (s, relu) = relu_forward(&a);
    let (out, pool) = max_pool_forward(&s, pool_param)?;
    Ok((out, ConvReluPoolCache { conv, relu, pool }))
}

/// Returns (dx, dw, db).
pub fn conv_relu_pool_backward<A: Scalar>(
    dout: &Array4<A>,
    cache: ConvReluPoolCache<A>,
) -> Result<(Array4<A>, Array4<A>, Array1<A>)> {
    let ds = max_pool_backward(dout, cache.pool)?;
    let da = relu_backward(&ds, cache.relu)?;
    conv_backward(&da, cache.conv)
}

pub struct ConvBnReluPoolCache<A> {
    conv: ConvCache<A>,
    bn: SpatialBatchNormCache<A>,
    relu: ReluCache<A, Ix4>,
    pool: PoolCache,
}

#[allow(clippy::too_many_arguments)]
pub fn conv_bn_relu_pool_forward<A: Scalar>(
    x: &Array4<A>,
    w: &Array4<A>,
    b: &Array1<A>,
    gamma: &Array1<A>,
    beta: &Array1<A>,
    bn_state: &mut BatchNormState<A>,
    conv_param: ConvParam,
    pool_param: PoolParam,
) -> Result<(Array4<A>, ConvBnReluPoolCache<A>)> {
    let (a, conv) = conv_forward(x, w, b, conv_param)?;
    let (an, bn) = spatial_batchnorm_forward(&a, gamma, beta, bn_state)?;
    let (s, relu) = relu_forward(&an);
    let (out, pool) = max_pool_forward(&s, pool_param)?;
    Ok((out, ConvBnReluPoolCache { conv, bn, relu, pool }))
}

/// Returns (dx, dw, db, dgamma, dbeta).
#[allow(clippy::type_complexity)]
pub fn conv_bn_relu_pool_backward<A: Scalar>(
    dout: &Array4<A>,
    cache: ConvBnReluPoolCache<A>,
) -> Result<(Array4<A>, Array4<A>, Array1<A>, Array1<A>, Array1<A>)> {
    let ds = max_pool_backward(dout, cache.pool)?;
    let dan = relu_backward(&ds, cache.relu)?;
    let (da, dgamma, dbeta) = spatial_batchnorm_backward(&dan, cache.bn)?;
    let (dx, dw, db) = conv_backward(&da, cache.conv)?;
    Ok((dx, dw, db, dgamma, dbeta))
}

pub struct AffineReluCache<A> {
    affine: AffineCache<A>,
    relu: ReluCache<A, Ix2>,
}

pub fn affine_relu_forward<A: Scalar>(
    x: &Array2<A>,
    w: &Array2<A>,
    b: &Array1<A>,
) -> Result<(Array2<A>, AffineReluCache<A>)> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (out, relu) = relu_forward(&a);
    Ok((out, AffineReluCache { affine, relu }))
}

pub fn affine_relu_backward<A: Scalar>(
    dout: &Array2<A>,
    cache: AffineReluCache<A>,
) -> Result<(Array2<A>, Array2<A>, Array1<A>)> {
    let da = relu_backward(dout, cache.relu)?;
    affine_backward(&da, cache.affine)
}

pub struct AffineBnReluCache<A> {
    affine: AffineCache<A>,
    bn: BatchNormCache<A>,
    relu: ReluCache<A, Ix2>,
}

pub fn affine_bn_relu_forward<A: Scalar>(
    x: &Array2<A>,
    w: &Array2<A>,
    b: &Array1<A>,
    gamma: &Array1<A>,
    beta: &Array1<A>,
    bn_state: &mut BatchNormState<A>,
) -> Result<(Array2<A>, AffineBnReluCache<A>)> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (an, bn) = batchnorm_forward(&a, gamma, beta, bn_state)?;
    let (out, relu) = relu_forward(&an);
    Ok((out, AffineBnReluCache { affine, bn, relu }))
}

/// Returns (dx, dw, db, dgamma, dbeta).
#[allow(clippy::type_complexity)]
pub fn affine_bn_relu_backward<A: Scalar>(
    dout: &Array2<A>,
    cache: AffineBnReluCache<A>,
) -> Result<(Array2<A>, Array2<A>, Array1<A>, Array1<A>, Array1<A>)> {
    let dan = relu_backward(dout, cache.relu)?;
    let (da, dgamma, dbeta) = batchnorm_backward(&dan, cache.bn)?;
    let (dx, dw, db) = affine_backward(&da, cache.affine)?;
    Ok((dx, dw, db, dgamma, dbeta))
}
