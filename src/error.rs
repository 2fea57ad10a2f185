use thiserror::Error;

/// Invalid hyperparameters, rejected before any parameter is allocated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("head count must be non-zero")]
    ZeroHeads,
    #[error("embed size {embed_size} must be divisible by the head count {heads}")]
    HeadsDoNotDivide { embed_size: usize, heads: usize },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Input dimensions disagree with each other or with the configured sizes.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("token {token} at position {position} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange {
        token: usize,
        position: usize,
        vocab_size: usize,
    },
    #[error("sequence length {len} exceeds max_length {max_length}")]
    SequenceTooLong { len: usize, max_length: usize },
    #[error("token batch is empty")]
    EmptyBatch,
    #[error("row {row} has {got} tokens, expected {expected}")]
    RaggedBatch {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("cannot sample from logits: {0}")]
    Sampling(String),
    #[error("device error: {0}")]
    Device(String),
}

impl Error {
    pub(crate) fn device<E: std::fmt::Debug>(err: E) -> Self {
        Error::Device(format!("{err:?}"))
    }

    pub(crate) fn shape(context: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Error::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
