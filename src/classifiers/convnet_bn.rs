use crate::config::{ConvNetConfig, Geometry};
use crate::error::Result;
use crate::utils::batchnorm::{BatchNormState, Mode};
use crate::utils::conv::ConvParam;
use crate::utils::fused::{
    affine_bn_relu_backward, affine_bn_relu_forward, conv_bn_relu_pool_backward, conv_bn_relu_pool_forward,
    AffineBnReluCache, ConvBnReluPoolCache,
};
use crate::utils::head::{check_labels, softmax_loss};
use crate::utils::linear::{affine_backward, affine_forward, AffineCache};
use crate::utils::mat::{flatten, gaussian, l2_penalty, unflatten, with_l2, Scalar};
use crate::utils::maxpool2x2::PoolParam;
use crate::utils::nn_trait::{Classifier, ParamSet};
use ndarray::{Array1, Array2, Array4, ArrayViewD, ArrayViewMutD};
use rand::Rng;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConvNetParams<A> {
    pub w1: Array4<A>,
    pub b1: Array1<A>,
    pub w2: Array2<A>,
    pub b2: Array1<A>,
    pub w3: Array2<A>,
    pub b3: Array1<A>,
    pub gamma1: Array1<A>,
    pub beta1: Array1<A>,
    pub gamma2: Array1<A>,
    pub beta2: Array1<A>,
}

impl<A: Scalar> ParamSet<A> for BatchNormConvNetParams<A> {
    fn entries(&self) -> Vec<(&'static str, ArrayViewD<'_, A>)> {
        vec![
            ("W1", self.w1.view().into_dyn()),
            ("b1", self.b1.view().into_dyn()),
            ("W2", self.w2.view().into_dyn()),
            ("b2", self.b2.view().into_dyn()),
            ("W3", self.w3.view().into_dyn()),
            ("b3", self.b3.view().into_dyn()),
            ("gamma1", self.gamma1.view().into_dyn()),
            ("beta1", self.beta1.view().into_dyn()),
            ("gamma2", self.gamma2.view().into_dyn()),
            ("beta2", self.beta2.view().into_dyn()),
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
            ("gamma1", self.gamma1.view_mut().into_dyn()),
            ("beta1", self.beta1.view_mut().into_dyn()),
            ("gamma2", self.gamma2.view_mut().into_dyn()),
            ("beta2", self.beta2.view_mut().into_dyn()),
        ]
    }
}

struct ForwardCaches<A> {
    conv: ConvBnReluPoolCache<A>,
    pooled_dim: (usize, usize, usize, usize),
    hidden: AffineBnReluCache<A>,
    scores: AffineCache<A>,
    // running statistics after this pass; written back only if the call succeeds
    bn1: BatchNormState<A>,
    bn2: BatchNormState<A>,
}

/// conv - batchnorm - relu - 2x2 max pool - affine - batchnorm - relu - affine - softmax
#[derive(Debug, Clone)]
pub struct BatchNormConvNet<A> {
    pub params: BatchNormConvNetParams<A>,
    pub reg: A,
    /// Running statistics after the convolution, one entry per filter
    pub bn1: BatchNormState<A>,
    /// Running statistics after the hidden affine layer
    pub bn2: BatchNormState<A>,
    conv_param: ConvParam,
    pool_param: PoolParam,
}

impl<A: Scalar> BatchNormConvNet<A> {
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
        let (f, fs, hidden) = (config.num_filters, config.filter_size, config.hidden_dim);
        let scale = config.weight_scale;

        let params = BatchNormConvNetParams {
            w1: gaussian((f, c, fs, fs), scale, rng),
            b1: Array1::zeros(f),
            w2: gaussian((flattened, hidden), scale, rng),
            b2: Array1::zeros(hidden),
            w3: gaussian((hidden, config.num_classes), scale, rng),
            b3: Array1::zeros(config.num_classes),
            gamma1: Array1::ones(f),
            beta1: Array1::zeros(f),
            gamma2: Array1::ones(hidden),
            beta2: Array1::zeros(hidden),
        };
        let (eps, momentum) = (A::of(config.bn_eps), A::of(config.bn_momentum));
        debug!(
            input_dim = ?config.input_dim,
            pooled = ?pooled_hw,
            flattened,
            num_params = params.num_params(),
            precision = ?A::PRECISION,
            "built batch-normalized convnet"
        );

        Ok(Self {
            params,
            reg: A::of(config.reg),
            bn1: BatchNormState::new(f, eps, momentum),
            bn2: BatchNormState::new(hidden, eps, momentum),
            conv_param,
            pool_param,
        })
    }

    /// Scores under an explicit normalization mode. Training mode folds the
    /// batch statistics into the running statistics. On error the
    /// normalization state is left as it was.
    pub fn forward_scores(&mut self, x: &Array4<A>, mode: Mode) -> Result<Array2<A>> {
        let (scores, caches) = self.forward(x, mode)?;
        self.bn1 = caches.bn1;
        self.bn2 = caches.bn2;
        Ok(scores)
    }

    fn forward(&self, x: &Array4<A>, mode: Mode) -> Result<(Array2<A>, ForwardCaches<A>)> {
        let mut bn1 = BatchNormState {
            mode,
            ..self.bn1.clone()
        };
        let mut bn2 = BatchNormState {
            mode,
            ..self.bn2.clone()
        };
        let p = &self.params;
        let (pooled, conv) = conv_bn_relu_pool_forward(
            x,
            &p.w1,
            &p.b1,
            &p.gamma1,
            &p.beta1,
            &mut bn1,
            self.conv_param,
            self.pool_param,
        )?;
        let (hidden, hidden_cache) =
            affine_bn_relu_forward(&flatten(&pooled)?, &p.w2, &p.b2, &p.gamma2, &p.beta2, &mut bn2)?;
        let (scores, scores_cache) = affine_forward(&hidden, &p.w3, &p.b3)?;
        Ok((
            scores,
            ForwardCaches {
                conv,
                pooled_dim: pooled.dim(),
                hidden: hidden_cache,
                scores: scores_cache,
                bn1,
                bn2,
            },
        ))
    }
}

impl<A: Scalar> Classifier<A> for BatchNormConvNet<A> {
    type Params = BatchNormConvNetParams<A>;

    fn params(&self) -> &Self::Params {
        &self.params
    }

    fn params_mut(&mut self) -> &mut Self::Params {
        &mut self.params
    }

    fn predict(&mut self, x: &Array4<A>) -> Result<Array2<A>> {
        self.forward_scores(x, Mode::Inference)
    }

    fn loss(&mut self, x: &Array4<A>, labels: &[usize]) -> Result<(A, Self::Params)> {
        check_labels(labels, x.dim().0, self.params.w3.ncols())?;
        let (scores, caches) = self.forward(x, Mode::Training)?;
        let (data_loss, dscores) = softmax_loss(&scores, labels)?;

        let p = &self.params;
        let reg = self.reg;
        let reg_loss = l2_penalty(&p.w1, reg) + l2_penalty(&p.w2, reg) + l2_penalty(&p.w3, reg);
        trace!(%data_loss, %reg_loss, "batchnorm convnet loss");

        let (dhidden, dw3, db3) = affine_backward(&dscores, caches.scores)?;
        let (dflat, dw2, db2, dgamma2, dbeta2) = affine_bn_relu_backward(&dhidden, caches.hidden)?;
        let dpooled = unflatten(&dflat, caches.pooled_dim)?;
        let (_, dw1, db1, dgamma1, dbeta1) = conv_bn_relu_pool_backward(&dpooled, caches.conv)?;

        let grads = BatchNormConvNetParams {
            w1: with_l2(dw1, &p.w1, reg),
            b1: db1,
            w2: with_l2(dw2, &p.w2, reg),
            b2: db2,
            w3: with_l2(dw3, &p.w3, reg),
            b3: db3,
            gamma1: dgamma1,
            beta1: dbeta1,
            gamma2: dgamma2,
            beta2: dbeta2,
        };
        self.bn1 = caches.bn1;
        self.bn2 = caches.bn2;
        Ok((data_loss + reg_loss, grads))
    }
}
