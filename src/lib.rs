//! Three-layer convolutional classifiers with hand-derived backward passes.
//!
//! ```text
//! ThreeLayerConvNet:  conv - relu - 2x2 max pool - affine - relu - affine - softmax
//! BatchNormConvNet:   conv - bn - relu - 2x2 max pool - affine - bn - relu - affine - softmax
//! ```
//!
//! The layer primitives live in [`utils`]; each forward returns its output and
//! a typed cache that the matching backward consumes.

pub mod classifiers;
pub mod config;
pub mod error;
pub mod utils;

pub use classifiers::{BatchNormConvNet, BatchNormConvNetParams, ConvNetParams, ThreeLayerConvNet};
pub use config::{ConvNetConfig, Precision};
pub use error::{NetError, Result};
pub use utils::batchnorm::{BatchNormState, Mode};
pub use utils::mat::Scalar;
pub use utils::nn_trait::{Classifier, Evaluation, ParamSet};
