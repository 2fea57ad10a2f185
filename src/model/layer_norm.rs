use dfdx::prelude::*;

use super::Hidden;

/// Normalizes the embedding axis, then applies a learned scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm<D: Storage<f32>> {
    pub gamma: Tensor<(usize,), f32, D>,
    pub beta: Tensor<(usize,), f32, D>,
}

impl<D: Device<f32>> LayerNorm<D> {
    pub fn try_new(dev: &D, dim: usize) -> Result<Self, D::Err> {
        Ok(Self {
            gamma: dev.try_ones_like(&(dim,))?,
            beta: dev.try_zeros_like(&(dim,))?,
        })
    }

    pub fn num_params(&self) -> usize {
        2 * self.gamma.shape().0
    }

    /// The caller guarantees the last axis has the normalized width.
    pub(crate) fn try_forward<T: Tape<f32, D>>(
        &self,
        x: Hidden<D, T>,
    ) -> Result<Hidden<D, T>, D::Err> {
        let shape = *x.shape();
        let gamma = self
            .gamma
            .retaped::<T>()
            .try_broadcast_like::<_, Axes2<0, 1>>(&shape)?;
        let beta = self
            .beta
            .retaped::<T>()
            .try_broadcast_like::<_, Axes2<0, 1>>(&shape)?;
        x.try_normalize::<Axis<2>>(1e-5)?
            .try_mul(gamma)?
            .try_add(beta)
    }
}
