use dfdx::prelude::*;
use rand::rngs::StdRng;

use super::{
    check_hidden, transformer::check_tokens, try_dropout, AttentionBlock, Embeddings, Hidden,
    LayerNorm, Linear, Mode, TransformerBlock,
};
use crate::{batch::TokenBatch, config::TransformerConfig, error::Error, mask::MaskBias};

/// Causally masked self-attention, then a [`TransformerBlock`] whose query is the
/// self-attention result and whose keys/values are the encoder output.
#[derive(Clone, Debug)]
pub struct DecoderBlock<D: Storage<f32>> {
    pub norm: LayerNorm<D>,
    pub attention: AttentionBlock<D>,
    pub transformer_block: TransformerBlock<D>,
    pub dropout: f32,
}

impl<D: Device<f32>> DecoderBlock<D> {
    pub fn try_new(dev: &D, cfg: &TransformerConfig, rng: &mut StdRng) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(Self {
            norm: LayerNorm::try_new(dev, cfg.embed_size).map_err(Error::device)?,
            attention: AttentionBlock::try_new(dev, cfg.embed_size, cfg.heads, rng)?,
            transformer_block: TransformerBlock::try_new(dev, cfg, rng)?,
            dropout: cfg.dropout,
        })
    }

    pub fn num_params(&self) -> usize {
        self.norm.num_params() + self.attention.num_params() + self.transformer_block.num_params()
    }

    /// `x` is `(batch, trg_len, embed)`, `enc_out` is `(batch, src_len, embed)`.
    /// `src_mask` must be `(batch, trg_len, src_len)`, `trg_mask` `(batch, trg_len, trg_len)`.
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        x: Hidden<D, T>,
        enc_out: Hidden<D>,
        src_mask: &MaskBias<D>,
        trg_mask: &MaskBias<D>,
        mode: Mode,
    ) -> Result<Hidden<D, T>, Error> {
        let x_ = x.retaped::<NoneTape>();
        self.attention
            .check_shapes(Some(&x_), &x_, &x, Some(trg_mask))?;
        self.transformer_block
            .attention
            .check_shapes(Some(&enc_out), &enc_out, &x, Some(src_mask))?;
        self.try_forward_unchecked(x, enc_out, src_mask, trg_mask, mode)
            .map_err(Error::device)
    }

    pub(crate) fn try_forward_unchecked<T: Tape<f32, D>>(
        &self,
        x: Hidden<D, T>,
        enc_out: Hidden<D>,
        src_mask: &MaskBias<D>,
        trg_mask: &MaskBias<D>,
        mode: Mode,
    ) -> Result<Hidden<D, T>, D::Err> {
        let (x, tape) = x.split_tape();
        let attention = self.attention.try_forward_unchecked(
            x.clone(),
            x.clone(),
            x.clone().put_tape(tape),
            Some(trg_mask),
        )?;
        let query = try_dropout(
            self.norm.try_forward(attention.try_add(x)?)?,
            self.dropout,
            mode,
        )?;
        self.transformer_block.try_forward_unchecked(
            enc_out.clone(),
            enc_out,
            query,
            Some(src_mask),
            mode,
        )
    }
}

/// Target-side stack: embeddings, `num_layers` [`DecoderBlock`]s and a projection to
/// target-vocabulary logits.
#[derive(Clone, Debug)]
pub struct Decoder<D: Storage<f32>> {
    pub embeddings: Embeddings<D>,
    pub layers: Vec<DecoderBlock<D>>,
    pub fc_out: Linear<D>,
    pub dropout: f32,
}

impl<D: Device<f32>> Decoder<D> {
    pub fn try_new(dev: &D, cfg: &TransformerConfig, rng: &mut StdRng) -> Result<Self, Error> {
        cfg.validate()?;
        let embeddings =
            Embeddings::try_new(dev, cfg.trg_vocab_size, cfg.max_length, cfg.embed_size, rng)?;
        let layers = (0..cfg.num_layers)
            .map(|_| DecoderBlock::try_new(dev, cfg, rng))
            .collect::<Result<_, _>>()?;
        let fc_out = Linear::try_new(dev, cfg.embed_size, cfg.trg_vocab_size, rng)?;
        Ok(Self {
            embeddings,
            layers,
            fc_out,
            dropout: cfg.dropout,
        })
    }

    pub fn num_params(&self) -> usize {
        self.embeddings.num_params()
            + self.layers.iter().map(|l| l.num_params()).sum::<usize>()
            + self.fc_out.num_params()
    }

    /// Returns logits `(batch, trg_len, trg_vocab)`. The tape of `enc_out` continues through
    /// the target embeddings.
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        trg: &TokenBatch,
        enc_out: Hidden<D, T>,
        src_mask: &MaskBias<D>,
        trg_mask: &MaskBias<D>,
        mode: Mode,
    ) -> Result<Hidden<D, T>, Error> {
        check_tokens(&self.embeddings, trg)?;
        let src_len = check_hidden(
            "decoder encoder output",
            &enc_out,
            trg.batch(),
            self.fc_out.in_features(),
        )?;
        let (b, t) = (trg.batch(), trg.seq_len());
        if src_mask.dims() != [b, t, src_len] {
            return Err(Error::shape("decoder source mask", &[b, t, src_len], &src_mask.dims()));
        }
        if trg_mask.dims() != [b, t, t] {
            return Err(Error::shape("decoder target mask", &[b, t, t], &trg_mask.dims()));
        }
        self.try_forward_unchecked(trg, enc_out, src_mask, trg_mask, mode)
            .map_err(Error::device)
    }

    pub(crate) fn try_forward_unchecked<T: Tape<f32, D>>(
        &self,
        trg: &TokenBatch,
        enc_out: Hidden<D, T>,
        src_mask: &MaskBias<D>,
        trg_mask: &MaskBias<D>,
        mode: Mode,
    ) -> Result<Hidden<D, T>, D::Err> {
        let (enc_out, tape) = enc_out.split_tape();
        let mut x = try_dropout(self.embeddings.try_forward(trg, tape)?, self.dropout, mode)?;
        for layer in self.layers.iter() {
            x = layer.try_forward_unchecked(x, enc_out.clone(), src_mask, trg_mask, mode)?;
        }
        self.fc_out.try_forward(x)
    }
}
