pub mod convnet;
pub mod convnet_bn;

pub use convnet::{ConvNetParams, ThreeLayerConvNet};
pub use convnet_bn::{BatchNormConvNet, BatchNormConvNetParams};
