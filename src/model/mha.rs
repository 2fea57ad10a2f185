use dfdx::prelude::*;
use rand::rngs::StdRng;

use super::{AttentionWeights, Hidden, Linear};
use crate::{config::check_heads, error::Error, mask::MaskBias};

/// A multi-head attention layer.
///
/// Values, keys and queries are each projected to `embed_size`, split into `heads` partitions
/// of `head_dim`, attended per head and recombined through `fc_out`.
///
/// Scores are scaled by `1 / sqrt(embed_size)` rather than `1 / sqrt(head_dim)`.
///
/// **Pytorch equivalent**: `torch.nn.MultiheadAttention(embed_size, heads, batch_first=True)`
/// apart from the score scale.
#[derive(Debug, Clone)]
pub struct AttentionBlock<D: Storage<f32>> {
    pub values: Linear<D>,
    pub keys: Linear<D>,
    pub queries: Linear<D>,
    pub fc_out: Linear<D>,
    embed_size: usize,
    heads: usize,
    head_dim: usize,
}

impl<D: Device<f32>> AttentionBlock<D> {
    /// Fails if `embed_size` does not split evenly into `heads`.
    pub fn try_new(
        dev: &D,
        embed_size: usize,
        heads: usize,
        rng: &mut StdRng,
    ) -> Result<Self, Error> {
        check_heads(embed_size, heads)?;
        let mut linear = || Linear::try_new(dev, embed_size, embed_size, rng);
        Ok(Self {
            values: linear()?,
            keys: linear()?,
            queries: linear()?,
            fc_out: linear()?,
            embed_size,
            heads,
            head_dim: embed_size / heads,
        })
    }

    pub fn embed_size(&self) -> usize {
        self.embed_size
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn num_params(&self) -> usize {
        [&self.values, &self.keys, &self.queries, &self.fc_out]
            .iter()
            .map(|l| l.num_params())
            .sum()
    }

    /// Attends `query` over `keys`/`values`. The output has the shape of `query`.
    pub fn try_forward<T: Tape<f32, D>>(
        &self,
        values: Hidden<D>,
        keys: Hidden<D>,
        query: Hidden<D, T>,
        mask: Option<&MaskBias<D>>,
    ) -> Result<Hidden<D, T>, Error> {
        self.check_shapes(Some(&values), &keys, &query, mask)?;
        self.try_forward_unchecked(values, keys, query, mask)
            .map_err(Error::device)
    }

    /// Post-softmax weights `(batch, heads, query_len, key_len)`, as used by [`Self::try_forward`].
    pub fn try_attention_weights(
        &self,
        keys: Hidden<D>,
        query: Hidden<D>,
        mask: Option<&MaskBias<D>>,
    ) -> Result<AttentionWeights<D>, Error> {
        self.check_shapes(None, &keys, &query, mask)?;
        self.try_weights(keys, query, mask).map_err(Error::device)
    }

    pub(crate) fn check_shapes<T: Tape<f32, D>>(
        &self,
        values: Option<&Hidden<D>>,
        keys: &Hidden<D>,
        query: &Hidden<D, T>,
        mask: Option<&MaskBias<D>>,
    ) -> Result<(), Error> {
        let (b, q, e) = *query.shape();
        if e != self.embed_size {
            return Err(Error::shape("attention query", &[b, q, self.embed_size], &[b, q, e]));
        }
        let (kb, k, ke) = *keys.shape();
        if kb != b || ke != self.embed_size {
            return Err(Error::shape("attention keys", &[b, k, self.embed_size], &[kb, k, ke]));
        }
        if let Some(values) = values {
            let got = *values.shape();
            if got != (b, k, self.embed_size) {
                return Err(Error::shape(
                    "attention values",
                    &[b, k, self.embed_size],
                    &[got.0, got.1, got.2],
                ));
            }
        }
        if let Some(mask) = mask {
            if mask.dims() != [b, q, k] {
                return Err(Error::shape("attention mask", &[b, q, k], &mask.dims()));
            }
        }
        Ok(())
    }

    pub(crate) fn try_forward_unchecked<T: Tape<f32, D>>(
        &self,
        values: Hidden<D>,
        keys: Hidden<D>,
        query: Hidden<D, T>,
        mask: Option<&MaskBias<D>>,
    ) -> Result<Hidden<D, T>, D::Err> {
        let (b, s1, _) = *query.shape();
        let s2 = values.shape().1;
        let (h, d) = (self.heads, self.head_dim);

        let v = self
            .values
            .try_forward(values.retaped::<T>())?
            .try_reshape_like(&(b, s2, h, d))?
            .try_permute::<_, Axes4<0, 2, 1, 3>>()?;

        let weights = self.try_weights(keys, query, mask)?;

        // Get new tokens
        let tokens = weights
            .try_matmul(v)?
            .try_permute::<_, Axes4<0, 2, 1, 3>>()?
            .try_reshape_like(&(b, s1, self.embed_size))?;

        self.fc_out.try_forward(tokens)
    }

    fn try_weights<T: Tape<f32, D>>(
        &self,
        keys: Hidden<D>,
        query: Hidden<D, T>,
        mask: Option<&MaskBias<D>>,
    ) -> Result<AttentionWeights<D, T>, D::Err> {
        let (b, s1, _) = *query.shape();
        let s2 = keys.shape().1;
        let (h, d) = (self.heads, self.head_dim);

        let k = self
            .keys
            .try_forward(keys.retaped::<T>())?
            .try_reshape_like(&(b, s2, h, d))?
            .try_permute::<_, Axes4<0, 2, 3, 1>>()?;

        let q = self
            .queries
            .try_forward(query)?
            .try_reshape_like(&(b, s1, h, d))?
            .try_permute::<_, Axes4<0, 2, 1, 3>>()?;

        let scalar = 1. / (self.embed_size as f32).sqrt();
        let energy = q.try_matmul(k)?.try_mul(scalar)?;
        let energy = match mask {
            Some(mask) => energy.try_add(
                mask.bias
                    .clone()
                    .try_broadcast_like::<_, Axis<1>>(&(b, h, s1, s2))?,
            )?,
            None => energy,
        };
        energy.try_softmax::<Axis<3>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{batch::TokenBatch, mask::AttentionMask};
    use rand::SeedableRng;

    fn hidden(dev: &Cpu, b: usize, s: usize, e: usize, offset: f32) -> Hidden<Cpu> {
        let data = (0..b * s * e)
            .map(|i| ((i as f32 + offset) * 0.37).sin())
            .collect();
        dev.tensor_from_vec(data, (b, s, e))
    }

    #[test]
    fn test_indivisible_heads_fail_construction() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let err = AttentionBlock::try_new(&dev, 10, 3, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(crate::ConfigError::HeadsDoNotDivide {
                embed_size: 10,
                heads: 3
            })
        ));
        let attn = AttentionBlock::try_new(&dev, 12, 3, &mut rng).unwrap();
        assert_eq!(attn.head_dim() * attn.heads(), attn.embed_size());
        assert_eq!(attn.num_params(), 4 * (12 * 12 + 12));
    }

    #[test]
    fn test_output_matches_query_shape() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        for (b, sq, sk, e, h) in [(1, 1, 1, 4, 1), (2, 3, 5, 8, 2), (3, 7, 2, 12, 4), (2, 4, 4, 16, 8)] {
            let attn = AttentionBlock::try_new(&dev, e, h, &mut rng).unwrap();
            let kv = hidden(&dev, b, sk, e, 0.);
            let out = attn
                .try_forward(kv.clone(), kv, hidden(&dev, b, sq, e, 1.), None)
                .unwrap();
            assert_eq!(*out.shape(), (b, sq, e));
        }
    }

    #[test]
    fn test_causal_weights_are_zero_above_diagonal() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(2);
        let attn = AttentionBlock::try_new(&dev, 8, 2, &mut rng).unwrap();
        let x = hidden(&dev, 2, 5, 8, 3.);
        let mask = AttentionMask::causal(2, 5).try_to_bias(&dev).unwrap();
        let weights = attn.try_attention_weights(x.clone(), x, Some(&mask)).unwrap();
        assert_eq!(*weights.shape(), (2, 2, 5, 5));

        let w = weights.as_vec();
        for (row_idx, row) in w.chunks(5).enumerate() {
            let i = row_idx % 5;
            for (j, p) in row.iter().enumerate() {
                if j > i {
                    assert_eq!(*p, 0., "query {i} attended to future key {j}");
                }
            }
            assert!((row.iter().sum::<f32>() - 1.).abs() < 1e-5);
        }
    }

    #[test]
    fn test_padding_keys_receive_no_weight() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(3);
        let attn = AttentionBlock::try_new(&dev, 8, 4, &mut rng).unwrap();
        let src = TokenBatch::new(vec![vec![1, 5, 6, 0, 0], vec![1, 8, 7, 3, 4]]).unwrap();
        let keys = hidden(&dev, 2, 5, 8, 0.);
        let query = hidden(&dev, 2, 3, 8, 5.);
        let mask = AttentionMask::padding(&src, 0, 3).try_to_bias(&dev).unwrap();
        let w = attn
            .try_attention_weights(keys, query, Some(&mask))
            .unwrap()
            .as_vec();
        // (batch, heads, query, key)
        for h in 0..4 {
            for q in 0..3 {
                let row = &w[((h * 3) + q) * 5..((h * 3) + q + 1) * 5];
                assert_eq!(row[3], 0.);
                assert_eq!(row[4], 0.);
                let other = &w[(((4 + h) * 3) + q) * 5..(((4 + h) * 3) + q + 1) * 5];
                assert!(other.iter().all(|p| *p > 0.));
            }
        }
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let attn = AttentionBlock::try_new(&dev, 8, 2, &mut rng).unwrap();

        let kv = hidden(&dev, 2, 4, 8, 0.);
        let wrong_width = hidden(&dev, 2, 3, 4, 0.);
        assert!(matches!(
            attn.try_forward(kv.clone(), kv.clone(), wrong_width, None),
            Err(Error::ShapeMismatch { .. })
        ));

        let wrong_batch = hidden(&dev, 1, 3, 8, 0.);
        assert!(matches!(
            attn.try_forward(kv.clone(), kv.clone(), wrong_batch, None),
            Err(Error::ShapeMismatch { .. })
        ));

        let short_values = hidden(&dev, 2, 3, 8, 0.);
        assert!(matches!(
            attn.try_forward(short_values, kv.clone(), hidden(&dev, 2, 3, 8, 0.), None),
            Err(Error::ShapeMismatch { .. })
        ));

        let mask = AttentionMask::causal(2, 3).try_to_bias(&dev).unwrap();
        assert!(matches!(
            attn.try_forward(kv.clone(), kv, hidden(&dev, 2, 3, 8, 0.), Some(&mask)),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
