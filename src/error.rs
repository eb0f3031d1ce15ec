use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("shape mismatch in {op}: expected {expected}, got {got}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        got: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },

    #[error("empty batch")]
    EmptyBatch,

    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, NetError>;

pub(crate) fn shape_mismatch(
    op: &'static str,
    expected: impl std::fmt::Debug,
    got: impl std::fmt::Debug,
) -> NetError {
    NetError::ShapeMismatch {
        op,
        expected: format!("{:?}", expected),
        got: format!("{:?}", got),
    }
}
