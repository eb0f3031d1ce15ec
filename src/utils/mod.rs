pub mod mat;
pub mod misc;
pub mod nn_trait;

pub mod batchnorm;
pub mod conv;
pub mod fused;
pub mod head;
pub mod linear;
pub mod maxpool2x2;
pub mod relu;
