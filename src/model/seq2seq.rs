use dfdx::prelude::*;
use rand::{rngs::StdRng, SeedableRng};

use super::{Decoder, Encoder, Hidden, Mode};
use crate::{
    batch::TokenBatch,
    config::TransformerConfig,
    error::Error,
    mask::{AttentionMask, MaskBias},
};

/// Encoder-decoder Transformer over source and target token batches.
///
/// The model keeps the device its parameters were built on; token batches are uploaded there
/// on every call.
#[derive(Clone, Debug)]
pub struct Transformer<D: Storage<f32>> {
    pub encoder: Encoder<D>,
    pub decoder: Decoder<D>,
    cfg: TransformerConfig,
    dev: D,
}

impl<D: Device<f32>> Transformer<D> {
    /// Validates `cfg` and initializes every parameter from `cfg.seed`.
    pub fn try_new(cfg: &TransformerConfig, dev: &D) -> Result<Self, Error> {
        cfg.validate()?;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        Ok(Self {
            encoder: Encoder::try_new(dev, cfg, &mut rng)?,
            decoder: Decoder::try_new(dev, cfg, &mut rng)?,
            cfg: *cfg,
            dev: dev.clone(),
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.cfg
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn num_params(&self) -> usize {
        self.encoder.num_params() + self.decoder.num_params()
    }

    /// True where the source token is not padding, repeated for `query_len` queries.
    pub fn make_src_mask(&self, src: &TokenBatch, query_len: usize) -> AttentionMask {
        AttentionMask::padding(src, self.cfg.src_pad_idx, query_len)
    }

    /// Lower-triangular causal mask for every target row.
    pub fn make_trg_mask(&self, trg: &TokenBatch) -> AttentionMask {
        AttentionMask::causal(trg.batch(), trg.seq_len())
    }

    /// Runs the encoder over `src` and the decoder over `trg`, returning logits
    /// `(batch, trg_len, trg_vocab_size)`.
    pub fn try_forward_with<T: Tape<f32, D>>(
        &self,
        src: &TokenBatch,
        trg: &TokenBatch,
        tape: T,
        mode: Mode,
    ) -> Result<Hidden<D, T>, Error> {
        if src.batch() != trg.batch() {
            return Err(Error::shape("target batch", &[src.batch()], &[trg.batch()]));
        }
        self.check_batch(src, self.cfg.src_vocab_size)?;
        self.check_batch(trg, self.cfg.trg_vocab_size)?;

        let to_bias = |mask: AttentionMask| -> Result<MaskBias<D>, Error> {
            mask.try_to_bias(&self.dev).map_err(Error::device)
        };
        let src_mask = to_bias(self.make_src_mask(src, src.seq_len()))?;
        let cross_mask = to_bias(self.make_src_mask(src, trg.seq_len()))?;
        let trg_mask = to_bias(self.make_trg_mask(trg))?;

        let enc_src = self
            .encoder
            .try_forward_unchecked(src, &src_mask, tape, mode)
            .map_err(Error::device)?;
        self.decoder
            .try_forward_unchecked(trg, enc_src, &cross_mask, &trg_mask, mode)
            .map_err(Error::device)
    }

    fn check_batch(&self, tokens: &TokenBatch, vocab_size: usize) -> Result<(), Error> {
        tokens.check_vocab(vocab_size)?;
        if tokens.seq_len() > self.cfg.max_length {
            return Err(Error::SequenceTooLong {
                len: tokens.seq_len(),
                max_length: self.cfg.max_length,
            });
        }
        Ok(())
    }
}

impl<'a, D: Device<f32>> Module<(&'a TokenBatch, &'a TokenBatch)> for Transformer<D> {
    type Output = Hidden<D>;
    type Error = Error;

    fn try_forward(
        &self,
        (src, trg): (&'a TokenBatch, &'a TokenBatch),
    ) -> Result<Self::Output, Error> {
        self.try_forward_with(src, trg, NoneTape, Mode::Eval)
    }
}
