pub mod decoder;
pub mod embedding;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod mha;
pub mod seq2seq;
pub mod transformer;

use dfdx::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

use crate::error::ConfigError;

pub use decoder::{Decoder, DecoderBlock};
pub use embedding::Embeddings;
pub use feed_forward::FeedForward;
pub use layer_norm::LayerNorm;
pub use linear::Linear;
pub use mha::AttentionBlock;
pub use seq2seq::Transformer;
pub use transformer::{Encoder, TransformerBlock};

/// Activations flowing between sublayers, shaped `(batch, seq_len, embed_size)`.
pub type Hidden<D, T = NoneTape> = Tensor<(usize, usize, usize), f32, D, T>;

/// Post-softmax attention weights, shaped `(batch, heads, query_len, key_len)`.
pub type AttentionWeights<D, T = NoneTape> = Tensor<(usize, usize, usize, usize), f32, D, T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Eval,
    /// Dropout active.
    Train,
}

/// Samples a parameter from `Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in))` on the host and
/// uploads it. Empty shapes and a zero `fan_in` are configuration errors.
pub(crate) fn try_uniform<S: Shape, D: Device<f32>>(
    dev: &D,
    shape: S,
    fan_in: usize,
    rng: &mut StdRng,
) -> Result<Tensor<S, f32, D>, crate::Error> {
    if fan_in == 0 || shape.num_elements() == 0 {
        return Err(ConfigError::Invalid(format!(
            "cannot initialize a parameter of shape {shape:?} with fan-in {fan_in}"
        ))
        .into());
    }
    let bound = 1. / (fan_in as f32).sqrt();
    let distr = Uniform::new_inclusive(-bound, bound);
    let data = (0..shape.num_elements())
        .map(|_| distr.sample(&mut *rng))
        .collect();
    dev.try_tensor_from_vec(data, shape)
        .map_err(crate::Error::device)
}

pub(crate) fn try_dropout<D: Device<f32>, T: Tape<f32, D>>(
    x: Hidden<D, T>,
    p: f32,
    mode: Mode,
) -> Result<Hidden<D, T>, D::Err> {
    match mode {
        Mode::Train if p > 0. => x.try_dropout(p),
        _ => Ok(x),
    }
}

pub(crate) fn check_hidden<D: Device<f32>, T: Tape<f32, D>>(
    context: &'static str,
    x: &Hidden<D, T>,
    batch: usize,
    embed_size: usize,
) -> Result<usize, crate::Error> {
    let (b, s, e) = *x.shape();
    if b != batch || e != embed_size {
        return Err(crate::Error::shape(context, &[batch, s, embed_size], &[b, s, e]));
    }
    Ok(s)
}
