//! Construction-time configuration shared by both classifiers.

use crate::error::{NetError, Result};
use crate::utils::conv::ConvParam;
use crate::utils::maxpool2x2::PoolParam;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Element type the network parameters are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvNetConfig {
    /// (C, H, W) of a single input image
    pub input_dim: (usize, usize, usize),
    pub num_filters: usize,
    pub filter_size: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    /// Standard deviation of the Gaussian used for weight initialization
    pub weight_scale: f64,
    /// L2 regularization strength
    pub reg: f64,
    pub precision: Precision,
    pub seed: Option<u64>,
    pub bn_eps: f64,
    pub bn_momentum: f64,
}

impl Default for ConvNetConfig {
    fn default() -> Self {
        Self {
            input_dim: (3, 32, 32),
            num_filters: 32,
            filter_size: 7,
            hidden_dim: 100,
            num_classes: 10,
            weight_scale: 1e-3,
            reg: 0.0,
            precision: Precision::F32,
            seed: None,
            bn_eps: 1e-5,
            bn_momentum: 0.9,
        }
    }
}

/// Spatial sizes implied by a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub conv_param: ConvParam,
    pub pool_param: PoolParam,
    pub conv_hw: (usize, usize),
    pub pooled_hw: (usize, usize),
    /// Width of the first affine layer's input
    pub flattened: usize,
}

impl ConvNetConfig {
    /// Small network used for numerical gradient checks.
    pub fn tiny() -> Self {
        Self {
            input_dim: (3, 16, 16),
            num_filters: 2,
            filter_size: 3,
            hidden_dim: 7,
            num_classes: 3,
            weight_scale: 1e-2,
            precision: Precision::F64,
            ..Self::default()
        }
    }

    pub fn with_input_dim(mut self, input_dim: (usize, usize, usize)) -> Self {
        self.input_dim = input_dim;
        self
    }

    pub fn with_filters(mut self, num_filters: usize, filter_size: usize) -> Self {
        self.num_filters = num_filters;
        self.filter_size = filter_size;
        self
    }

    pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_weight_scale(mut self, weight_scale: f64) -> Self {
        self.weight_scale = weight_scale;
        self
    }

    pub fn with_reg(mut self, reg: f64) -> Self {
        self.reg = reg;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let (c, h, w) = self.input_dim;
        if c == 0 || h == 0 || w == 0 {
            return Err(NetError::InvalidConfig(format!(
                "input_dim must be non-zero, got {:?}",
                self.input_dim
            )));
        }
        for (name, value) in [
            ("num_filters", self.num_filters),
            ("filter_size", self.filter_size),
            ("hidden_dim", self.hidden_dim),
            ("num_classes", self.num_classes),
        ] {
            if value == 0 {
                return Err(NetError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if !(self.weight_scale.is_finite() && self.weight_scale > 0.0) {
            return Err(NetError::InvalidConfig(format!(
                "weight_scale must be positive and finite, got {}",
                self.weight_scale
            )));
        }
        if !(self.reg.is_finite() && self.reg >= 0.0) {
            return Err(NetError::InvalidConfig(format!(
                "reg must be non-negative, got {}",
                self.reg
            )));
        }
        if !(self.bn_eps > 0.0) {
            return Err(NetError::InvalidConfig(format!(
                "bn_eps must be positive, got {}",
                self.bn_eps
            )));
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(NetError::InvalidConfig(format!(
                "bn_momentum must be in [0, 1], got {}",
                self.bn_momentum
            )));
        }
        self.geometry().map(|_| ())
    }

    /// Derives the post-pool size from the conv and pool parameters rather
    /// than from a closed-form shortcut.
    pub fn geometry(&self) -> Result<Geometry> {
        let (_, h, w) = self.input_dim;
        let conv_param = ConvParam::same(self.filter_size);
        let pool_param = PoolParam::default();
        let conv_hw = conv_param
            .output_size((h, w), (self.filter_size, self.filter_size))
            .ok_or_else(|| {
                NetError::InvalidConfig(format!(
                    "filter_size {} does not fit input {}x{}",
                    self.filter_size, h, w
                ))
            })?;
        let pooled_hw = pool_param.output_size(conv_hw).ok_or_else(|| {
            NetError::InvalidConfig(format!(
                "conv output {}x{} is smaller than the pool window",
                conv_hw.0, conv_hw.1
            ))
        })?;
        Ok(Geometry {
            conv_param,
            pool_param,
            conv_hw,
            pooled_hw,
            flattened: self.num_filters * pooled_hw.0 * pooled_hw.1,
        })
    }

    /// Errors unless the network's element type is the one this config asks for.
    pub fn ensure_precision(&self, built: Precision) -> Result<()> {
        if built == self.precision {
            Ok(())
        } else {
            Err(NetError::InvalidConfig(format!(
                "config asks for {:?} parameters, network is {:?}",
                self.precision, built
            )))
        }
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}
