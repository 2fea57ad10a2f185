use dfdx::prelude::*;

use crate::{batch::TokenBatch, error::Error};

/// Value added to attention scores at disallowed positions.
pub const MASKED_SCORE: f32 = -1e20;

/// Which query positions may attend to which key positions, per batch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMask {
    allowed: Vec<bool>,
    batch: usize,
    query_len: usize,
    key_len: usize,
}

impl AttentionMask {
    /// Hides every key whose token equals `pad_idx`, for all `query_len` queries.
    pub fn padding(keys: &TokenBatch, pad_idx: usize, query_len: usize) -> Self {
        let key_len = keys.seq_len();
        let mut allowed = Vec::with_capacity(keys.batch() * query_len * key_len);
        for row in keys.rows() {
            for _ in 0..query_len {
                allowed.extend(row.iter().map(|&t| t != pad_idx));
            }
        }
        Self {
            allowed,
            batch: keys.batch(),
            query_len,
            key_len,
        }
    }

    /// Lower triangular: query `i` sees keys `0..=i`.
    pub fn causal(batch: usize, len: usize) -> Self {
        let allowed = (0..batch)
            .flat_map(move |_| (0..len).flat_map(move |i| (0..len).map(move |j| j <= i)))
            .collect();
        Self {
            allowed,
            batch,
            query_len: len,
            key_len: len,
        }
    }

    /// Positions allowed by both masks.
    pub fn and(&self, other: &Self) -> Result<Self, Error> {
        if self.dims() != other.dims() {
            return Err(Error::shape(
                "mask intersection",
                &self.dims(),
                &other.dims(),
            ));
        }
        Ok(Self {
            allowed: self
                .allowed
                .iter()
                .zip(&other.allowed)
                .map(|(a, b)| *a && *b)
                .collect(),
            ..*self
        })
    }

    /// `[batch, query_len, key_len]`
    pub fn dims(&self) -> [usize; 3] {
        [self.batch, self.query_len, self.key_len]
    }

    /// `None` if any index is outside [`Self::dims`].
    pub fn is_allowed(&self, b: usize, q: usize, k: usize) -> Option<bool> {
        if b >= self.batch || q >= self.query_len || k >= self.key_len {
            return None;
        }
        Some(self.allowed[(b * self.query_len + q) * self.key_len + k])
    }

    /// Uploads the mask as an additive score bias: `0` where allowed, [`MASKED_SCORE`] elsewhere.
    pub fn try_to_bias<D: Device<f32>>(&self, dev: &D) -> Result<MaskBias<D>, D::Err> {
        let data = self
            .allowed
            .iter()
            .map(|&a| if a { 0. } else { MASKED_SCORE })
            .collect();
        Ok(MaskBias {
            bias: dev.try_tensor_from_vec(data, (self.batch, self.query_len, self.key_len))?,
        })
    }
}

/// A device-resident mask, shaped `(batch, query_len, key_len)`.
#[derive(Debug, Clone)]
pub struct MaskBias<D: Storage<f32>> {
    pub bias: Tensor<(usize, usize, usize), f32, D>,
}

impl<D: Storage<f32>> MaskBias<D> {
    pub fn dims(&self) -> [usize; 3] {
        let (b, q, k) = *self.bias.shape();
        [b, q, k]
    }
}
