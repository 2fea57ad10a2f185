use dfdx::prelude::*;
use rand::rngs::StdRng;

use super::{try_uniform, Hidden};
use crate::{batch::TokenBatch, error::Error};

/// Learned token embeddings summed with learned positional embeddings.
///
/// Holds the device that token batches are uploaded to, so inputs always land where the
/// weights live.
#[derive(Debug, Clone)]
pub struct Embeddings<D: Storage<f32>> {
    /// Shape `(vocab, embed_size)`
    pub token: Tensor<(usize, usize), f32, D>,
    /// Shape `(max_length, embed_size)`
    pub position: Tensor<(usize, usize), f32, D>,
    dev: D,
}

impl<D: Device<f32>> Embeddings<D> {
    pub fn try_new(
        dev: &D,
        vocab: usize,
        max_length: usize,
        embed_size: usize,
        rng: &mut StdRng,
    ) -> Result<Self, Error> {
        Ok(Self {
            token: try_uniform(dev, (vocab, embed_size), vocab, rng)?,
            position: try_uniform(dev, (max_length, embed_size), max_length, rng)?,
            dev: dev.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.token.shape().0
    }

    pub fn max_length(&self) -> usize {
        self.position.shape().0
    }

    pub fn num_params(&self) -> usize {
        self.token.shape().num_elements() + self.position.shape().num_elements()
    }

    /// Looks up `tokens` and positions `0..seq_len`, returning `(batch, seq_len, embed_size)`.
    /// Token ids and lengths must already be checked against the table sizes.
    pub(crate) fn try_forward<T: Tape<f32, D>>(
        &self,
        tokens: &TokenBatch,
        tape: T,
    ) -> Result<Hidden<D, T>, D::Err> {
        let ids = tokens.try_to_device(&self.dev)?;
        let positions = self
            .dev
            .try_tensor_from_vec(tokens.positions(), (tokens.batch(), tokens.seq_len()))?;
        let words: Hidden<D, T> = self.token.clone().put_tape(tape).try_gather(ids)?;
        let positions: Hidden<D, T> = self.position.retaped::<T>().try_gather(positions)?;
        words.try_add(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_same_token_differs_by_position() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let emb = Embeddings::try_new(&dev, 10, 6, 4, &mut rng).unwrap();
        assert_eq!((emb.vocab_size(), emb.max_length()), (10, 6));
        assert_eq!(emb.num_params(), 10 * 4 + 6 * 4);

        let tokens = TokenBatch::new(vec![vec![3, 3, 3]]).unwrap();
        let out = emb.try_forward(&tokens, NoneTape).unwrap();
        assert_eq!(*out.shape(), (1, 3, 4));
        let out = out.as_vec();
        assert_ne!(out[0..4], out[4..8]);

        let word = emb.token.as_vec();
        let pos = emb.position.as_vec();
        for i in 0..4 {
            assert!((out[4 + i] - (word[3 * 4 + i] + pos[4 + i])).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_tables_are_config_errors() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        for (vocab, max_length, embed_size) in [(0, 6, 4), (10, 0, 4), (10, 6, 0)] {
            assert!(matches!(
                Embeddings::try_new(&dev, vocab, max_length, embed_size, &mut rng),
                Err(Error::Config(_))
            ));
        }
    }
}
