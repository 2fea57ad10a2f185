use dfdx::prelude::*;
use rand::rngs::StdRng;

use super::{try_uniform, Hidden};
use crate::error::Error;

/// Affine projection over the last axis with runtime sized weights.
#[derive(Debug, Clone)]
pub struct Linear<D: Storage<f32>> {
    /// Stored transposed, shape `(in, out)`
    pub weight: Tensor<(usize, usize), f32, D>,
    pub bias: Tensor<(usize,), f32, D>,
}

impl<D: Device<f32>> Linear<D> {
    /// Fails with a configuration error if either width is zero.
    pub fn try_new(dev: &D, inp: usize, out: usize, rng: &mut StdRng) -> Result<Self, Error> {
        Ok(Self {
            weight: try_uniform(dev, (inp, out), inp, rng)?,
            bias: try_uniform(dev, (out,), inp, rng)?,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().0
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().1
    }

    pub fn num_params(&self) -> usize {
        self.weight.shape().num_elements() + self.bias.shape().num_elements()
    }

    /// `(batch, seq, in) -> (batch, seq, out)`. The caller guarantees the input width.
    pub(crate) fn try_forward<T: Tape<f32, D>>(
        &self,
        x: Hidden<D, T>,
    ) -> Result<Hidden<D, T>, D::Err> {
        let (b, s, _) = *x.shape();
        let bias = self
            .bias
            .retaped::<T>()
            .try_broadcast_like::<_, Axes2<0, 1>>(&(b, s, self.out_features()))?;
        x.try_matmul(self.weight.retaped::<T>())?.try_add(bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_projects_last_axis() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let linear = Linear::try_new(&dev, 4, 6, &mut rng).unwrap();
        assert_eq!((linear.in_features(), linear.out_features()), (4, 6));
        assert_eq!(linear.num_params(), 4 * 6 + 6);

        let x: Hidden<Cpu> = dev.tensor_from_vec(vec![0.5; 2 * 3 * 4], (2, 3, 4));
        let y = linear.try_forward(x).unwrap();
        assert_eq!(*y.shape(), (2, 3, 6));
    }

    #[test]
    fn test_zero_width_is_a_config_error() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        for (inp, out) in [(0, 4), (4, 0), (0, 0)] {
            assert!(matches!(
                Linear::try_new(&dev, inp, out, &mut rng),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn test_zero_input_yields_bias() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(1);
        let linear = Linear::try_new(&dev, 3, 2, &mut rng).unwrap();
        let x: Hidden<Cpu> = dev.tensor_from_vec(vec![0.; 3], (1, 1, 3));
        let y = linear.try_forward(x).unwrap().as_vec();
        let bias = linear.bias.as_vec();
        for (a, b) in y.iter().zip(bias.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
