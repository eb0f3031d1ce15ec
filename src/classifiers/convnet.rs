use crate::config::{ConvNetConfig, Geometry};
use crate::error::Result;
use crate::utils::conv::ConvParam;
use crate::utils::fused::{
    affine_relu_backward, affine_relu_forward, conv_relu_pool_backward, conv_relu_pool_forward, AffineReluCache,
    ConvReluPoolCache,
};
use crate::utils::head::{check_labels, softmax_loss};
use crate::utils::linear::{affine_backward, affine_forward, AffineCache};
use crate::utils::mat::{flatten, gaussian, l2_penalty, unflatten, with_l2, Scalar};
use crate::utils::maxpool2x2::PoolParam;
use crate::utils::nn_trait::{Classifier, ParamSet};
use ndarray::{Array1, Array2, Array4, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use tracing::{debug, trace};

/// Parameters (and, with the same layout, gradients) of [`ThreeLayerConvNet`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConvNetParams<A> {
    /// (F, C, FS, FS)
    pub w1: Array4<A>,
    pub b1: Array1<A>,
    /// (F * H' * W', hidden)
    pub w2: Array2<A>,
    pub b2: Array1<A>,
    /// (hidden, classes)
    pub w3: Array2<A>,
    pub b3: Array1<A>,
}

impl<A: Scalar> ParamSet<A> for ConvNetParams<A> {
    fn entries(&self) -> Vec<(&'static str, ArrayViewD<'_, A>)> {
        vec![
            ("W1", self.w1.view().into_dyn()),
            ("b1", self.b1.view().into_dyn()),
            ("W2", self.w2.view().into_dyn()),
            ("b2", self.b2.view().into_dyn()),
            ("W3", self.w3.view().into_dyn()),
            ("b3", self.b3.view().into_dyn()),
        ]
    }

    fn entries_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, A>)> {
        vec![
            ("W1", self.w1.view_mut().into_dyn()),
            ("b1", self.b1.view_mut().into_dyn()),
            ("W2", self.w2.view_mut().into_dyn()),
            ("b2", self.b2.view_mut().into_dyn()),
            ("W3", self.w3.view_mut().into_dyn()),
            ("b3", self.b3.view_mut().into_dyn()),
        ]
    }
}

struct ForwardCaches<A> {
    conv: ConvReluPoolCache<A>,
    pooled_dim: (usize, usize, usize, usize),
    hidden: AffineReluCache<A>,
    scores: AffineCache<A>,
}

/// conv - relu - 2x2 max pool - affine - relu - affine - softmax
///
/// Operates on minibatches of shape (N, C, H, W).
#[derive(Debug, Clone)]
pub struct ThreeLayerConvNet<A> {
    pub params: ConvNetParams<A>,
    pub reg: A,
    conv_param: ConvParam,
    pool_param: PoolParam,
}

impl<A: Scalar> ThreeLayerConvNet<A> {
    pub fn new(config: &ConvNetConfig) -> Result<Self> {
        Self::with_rng(config, &mut config.rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: &ConvNetConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        config.ensure_precision(A::PRECISION)?;
        let Geometry {
            conv_param,
            pool_param,
            pooled_hw,
            flattened,
            ..
        } = config.geometry()?;
        let (c, _, _) = config.input_dim;
        let (f, fs) = (config.num_filters, config.filter_size);
        let scale = config.weight_scale;

        let params = ConvNetParams {
            w1: gaussian((f, c, fs, fs), scale, rng),
            b1: Array1::zeros(f),
            w2: gaussian((flattened, config.hidden_dim), scale, rng),
            b2: Array1::zeros(config.hidden_dim),
            w3: gaussian((config.hidden_dim, config.num_classes), scale, rng),
            b3: Array1::zeros(config.num_classes),
        };
        debug!(
            input_dim = ?config.input_dim,
            pooled = ?pooled_hw,
            flattened,
            num_params = params.num_params(),
            precision = ?A::PRECISION,
            "built three-layer convnet"
        );

        Ok(Self {
            params,
            reg: A::of(config.reg),
            conv_param,
            pool_param,
        })
    }

    fn forward(&self, x: &Array4<A>) -> Result<(Array2<A>, ForwardCaches<A>)> {
        let p = &self.params;
        let (pooled, conv) = conv_relu_pool_forward(x, &p.w1, &p.b1, self.conv_param, self.pool_param)?;
        let (hidden, hidden_cache) = affine_relu_forward(&flatten(&pooled)?, &p.w2, &p.b2)?;
        let (scores, scores_cache) = affine_forward(&hidden, &p.w3, &p.b3)?;
        Ok((
            scores,
            ForwardCaches {
                conv,
                pooled_dim: pooled.dim(),
                hidden: hidden_cache,
                scores: scores_cache,
            },
        ))
    }
}

impl<A: Scalar> Classifier<A> for ThreeLayerConvNet<A> {
    type Params = ConvNetParams<A>;

    fn params(&self) -> &Self::Params {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Self::Params {
        &mut self.params
    }

    fn predict(&mut self, x: &Array4<A>) -> Result<Array2<A>> {
        self.forward(x).map(|(scores, _)| scores)
    }

    fn loss(&mut self, x: &Array4<A>, labels: &[usize]) -> Result<(A, Self::Params)> {
        check_labels(labels, x.dim().0, self.params.w3.ncols())?;
        let (scores, caches) = self.forward(x)?;
        let (data_loss, dscores) = softmax_loss(&scores, labels)?;

        let p = &self.params;
        let reg = self.reg;
        let reg_loss = l2_penalty(&p.w1, reg) + l2_penalty(&p.w2, reg) + l2_penalty(&p.w3, reg);
        trace!(%data_loss, %reg_loss, "convnet loss");

        let (dhidden, dw3, db3) = affine_backward(&dscores, caches.scores)?;
        let (dflat, dw2, db2) = affine_relu_backward(&dhidden, caches.hidden)?;
        let dpooled = unflatten(&dflat, caches.pooled_dim)?;
        let (_, dw1, db1) = conv_relu_pool_backward(&dpooled, caches.conv)?;

        let grads = ConvNetParams {
            w1: with_l2(dw1, &p.w1, reg),
            b1: db1,
            w2: with_l2(dw2, &p.w2, reg),
            b2: db2,
            w3: with_l2(dw3, &p.w3, reg),
            b3: db3,
        };
        Ok((data_loss + reg_loss, grads))
    }
}
