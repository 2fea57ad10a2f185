//! Autoregressive decoding on top of [`Transformer`]'s forward pass.

use dfdx::prelude::*;
use rand::{distributions::WeightedIndex, Rng};
use rand_distr::Distribution;

use crate::{
    batch::TokenBatch,
    error::{ConfigError, Error},
    model::{Mode, Transformer},
    utils::{argmax, softmax},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoding {
    /// Always take the highest scoring token.
    Greedy,
    /// Sample from the softmax of the logits divided by `temperature`.
    Sample { temperature: f32 },
}

impl<D: Device<f32>> Transformer<D> {
    /// Decodes one source sequence, starting the target from `start_token`.
    ///
    /// Each step reruns the full model on the last `max_length` target tokens and picks the
    /// next token from the final position. Stops after `end_token` or `max_new_tokens` steps and
    /// returns the generated tokens, `end_token` included if it was produced.
    pub fn generate<R: Rng>(
        &self,
        src: &[usize],
        start_token: usize,
        end_token: usize,
        max_new_tokens: usize,
        decoding: Decoding,
        rng: &mut R,
    ) -> Result<Vec<usize>, Error> {
        if let Decoding::Sample { temperature } = decoding {
            if temperature.is_nan() || temperature <= 0. {
                return Err(ConfigError::Invalid(format!(
                    "sampling temperature must be positive, got {temperature}"
                ))
                .into());
            }
        }
        let src = TokenBatch::new(vec![src.to_vec()])?;
        let vocab = self.config().trg_vocab_size;
        let mut tokens = vec![start_token];

        for _ in 0..max_new_tokens {
            let trg = TokenBatch::new(vec![tokens.clone()])?.last_columns(self.config().max_length);
            let logits = self
                .try_forward_with(&src, &trg, NoneTape, Mode::Eval)?
                .as_vec();
            let mut last = logits[(trg.seq_len() - 1) * vocab..].to_vec();
            let next = match decoding {
                Decoding::Greedy => argmax(&last),
                Decoding::Sample { temperature } => {
                    softmax(&mut last, temperature);
                    WeightedIndex::new(&last)
                        .map_err(|e| Error::Sampling(e.to_string()))?
                        .sample(rng)
                }
            };
            tokens.push(next);
            if next == end_token {
                break;
            }
        }
        Ok(tokens.split_off(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransformerConfig;
    use rand::{rngs::StdRng, SeedableRng};

    fn model() -> Transformer<Cpu> {
        let cfg = TransformerConfig {
            embed_size: 8,
            heads: 2,
            num_layers: 1,
            max_length: 6,
            ..TransformerConfig::new(10, 10)
        };
        Transformer::try_new(&cfg, &Cpu::default()).unwrap()
    }

    #[test]
    fn test_greedy_is_deterministic_and_bounded() {
        let model = model();
        let mut rng = StdRng::seed_from_u64(0);
        let a = model
            .generate(&[1, 4, 5, 2], 1, usize::MAX, 9, Decoding::Greedy, &mut rng)
            .unwrap();
        let b = model
            .generate(&[1, 4, 5, 2], 1, usize::MAX, 9, Decoding::Greedy, &mut rng)
            .unwrap();
        // Runs past max_length by sliding the target window.
        assert_eq!(a.len(), 9);
        assert_eq!(a, b);
        assert!(a.iter().all(|t| *t < 10));
    }

    #[test]
    fn test_stops_at_end_token() {
        let model = model();
        let mut rng = StdRng::seed_from_u64(0);
        let greedy = model
            .generate(&[1, 4, 5, 2], 1, usize::MAX, 1, Decoding::Greedy, &mut rng)
            .unwrap();
        let end = greedy[0];
        let out = model
            .generate(&[1, 4, 5, 2], 1, end, 5, Decoding::Greedy, &mut rng)
            .unwrap();
        assert_eq!(out, vec![end]);
    }

    #[test]
    fn test_sampling() {
        let model = model();
        let mut rng = StdRng::seed_from_u64(7);
        let out = model
            .generate(
                &[1, 2, 3],
                1,
                usize::MAX,
                4,
                Decoding::Sample { temperature: 0.8 },
                &mut rng,
            )
            .unwrap();
        assert_eq!(out.len(), 4);
        assert!(matches!(
            model.generate(&[1], 1, 2, 4, Decoding::Sample { temperature: 0. }, &mut rng),
            Err(Error::Config(_))
        ));
    }
}
