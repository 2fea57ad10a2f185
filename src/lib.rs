pub mod batch;
pub mod config;
pub mod error;
pub mod generate;
pub mod mask;
pub mod model;
pub mod utils;

pub use batch::TokenBatch;
pub use config::{Activation, TransformerConfig};
pub use error::{ConfigError, Error};
pub use generate::Decoding;
pub use mask::{AttentionMask, MaskBias, MASKED_SCORE};
pub use model::{
    AttentionBlock, Decoder, DecoderBlock, Encoder, Hidden, Mode, Transformer, TransformerBlock,
};
