use dfdx::prelude::*;
use rand::rngs::StdRng;

use super::{
    try_dropout, AttentionBlock, Embeddings, FeedForward, Hidden, LayerNorm, Mode,
};
use crate::{batch::TokenBatch, config::TransformerConfig, error::Error, mask::MaskBias};

/// Attention followed by a feed-forward sublayer, each wrapped in a residual connection and
/// post-normalization:
///
/// ```text
/// x   = dropout(norm1(attention(value, key, query) + query))
/// out = dropout(norm2(ff(x) + x))
/// ```
#[derive(Clone, Debug)]
pub struct TransformerBlock<D: Storage<f32>> {
    pub attention: AttentionBlock<D>,
    pub norm1: LayerNorm<D>,
    pub norm2: LayerNorm<D>,
    pub feed_forward: FeedForward<D>,
    pub dropout: f32,
}

impl<D: Device<f32>> TransformerBlock<D> {
    /// Fails if `cfg` does not validate.
    pub fn try_new(dev: &D, cfg: &TransformerConfig, rng: &mut StdRng) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(Self {
            attention: AttentionBlock::try_new(dev, cfg.embed_size, cfg.heads, rng)?,
            norm1: LayerNorm::try_new(dev, cfg.embed_size).map_err(Error::device)?,
            norm2: LayerNorm::try_new(dev, cfg.embed_size).map_err(Error::device)?,
            feed_forward: FeedForward::try_new(
                dev,
                cfg.embed_size,
                cfg.ff_dim(),
                cfg.activation,
                rng,
            )?,
            dropout: cfg.dropout,
        })
    }

    pub fn num_params(&self) -> usize {
        self.attention.num_params()
            + self.norm1.num_params()
            + self.norm2.num_params()
            + self.feed_forward.num_params()
    }

    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        value: Hidden<D>,
        key: Hidden<D>,
        query: Hidden<D, T>,
        mask: Option<&MaskBias<D>>,
        mode: Mode,
    ) -> Result<Hidden<D, T>, Error> {
        self.attention
            .check_shapes(Some(&value), &key, &query, mask)?;
        self.try_forward_unchecked(value, key, query, mask, mode)
            .map_err(Error::device)
    }

    pub(crate) fn try_forward_unchecked<T: Tape<f32, D>>(
        &self,
        value: Hidden<D>,
        key: Hidden<D>,
        query: Hidden<D, T>,
        mask: Option<&MaskBias<D>>,
        mode: Mode,
    ) -> Result<Hidden<D, T>, D::Err> {
        let (query, tape) = query.split_tape();
        let attention =
            self.attention
                .try_forward_unchecked(value, key, query.clone().put_tape(tape), mask)?;
        let x = try_dropout(
            self.norm1.try_forward(attention.try_add(query)?)?,
            self.dropout,
            mode,
        )?;
        let (x, tape) = x.split_tape();
        let forward = self.feed_forward.try_forward(x.clone().put_tape(tape))?;
        try_dropout(self.norm2.try_forward(forward.try_add(x)?)?, self.dropout, mode)
    }
}

/// Source-side stack: embeddings followed by `num_layers` self-attending [`TransformerBlock`]s.
#[derive(Clone, Debug)]
pub struct Encoder<D: Storage<f32>> {
    pub embeddings: Embeddings<D>,
    pub layers: Vec<TransformerBlock<D>>,
    pub dropout: f32,
}

impl<D: Device<f32>> Encoder<D> {
    pub fn try_new(dev: &D, cfg: &TransformerConfig, rng: &mut StdRng) -> Result<Self, Error> {
        cfg.validate()?;
        let embeddings =
            Embeddings::try_new(dev, cfg.src_vocab_size, cfg.max_length, cfg.embed_size, rng)?;
        let layers = (0..cfg.num_layers)
            .map(|_| TransformerBlock::try_new(dev, cfg, rng))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            embeddings,
            layers,
            dropout: cfg.dropout,
        })
    }

    pub fn num_params(&self) -> usize {
        self.embeddings.num_params() + self.layers.iter().map(|l| l.num_params()).sum::<usize>()
    }

    /// Encodes `src` into `(batch, src_len, embed_size)`. `mask` must be `(batch, src_len, src_len)`.
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        src: &TokenBatch,
        mask: &MaskBias<D>,
        tape: T,
        mode: Mode,
    ) -> Result<Hidden<D, T>, Error> {
        check_tokens(&self.embeddings, src)?;
        let expected = [src.batch(), src.seq_len(), src.seq_len()];
        if mask.dims() != expected {
            return Err(Error::shape("encoder mask", &expected, &mask.dims()));
        }
        self.try_forward_unchecked(src, mask, tape, mode)
            .map_err(Error::device)
    }

    pub(crate) fn try_forward_unchecked<T: Tape<f32, D>>(
        &self,
        src: &TokenBatch,
        mask: &MaskBias<D>,
        tape: T,
        mode: Mode,
    ) -> Result<Hidden<D, T>, D::Err> {
        let mut out = try_dropout(self.embeddings.try_forward(src, tape)?, self.dropout, mode)?;
        for layer in self.layers.iter() {
            let (x, tape) = out.split_tape();
            out = layer.try_forward_unchecked(
                x.clone(),
                x.clone(),
                x.put_tape(tape),
                Some(mask),
                mode,
            )?;
        }
        Ok(out)
    }
}

/// Rejects token ids and sequence lengths the embedding tables can't index.
pub(crate) fn check_tokens<D: Device<f32>>(
    embeddings: &Embeddings<D>,
    tokens: &TokenBatch,
) -> Result<(), Error> {
    tokens.check_vocab(embeddings.vocab_size())?;
    if tokens.seq_len() > embeddings.max_length() {
        return Err(Error::SequenceTooLong {
            len: tokens.seq_len(),
            max_length: embeddings.max_length(),
        });
    }
    Ok(())
}
