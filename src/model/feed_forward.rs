use dfdx::prelude::*;
use rand::rngs::StdRng;

use super::{Hidden, Linear};
use crate::{config::Activation, error::Error};

/// Position-wise `Linear -> activation -> Linear` with a widened hidden layer.
#[derive(Debug, Clone)]
pub struct FeedForward<D: Storage<f32>> {
    pub up: Linear<D>,
    pub down: Linear<D>,
    pub activation: Activation,
}

impl<D: Device<f32>> FeedForward<D> {
    pub fn try_new(
        dev: &D,
        embed_size: usize,
        hidden: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Self, Error> {
        Ok(Self {
            up: Linear::try_new(dev, embed_size, hidden, rng)?,
            down: Linear::try_new(dev, hidden, embed_size, rng)?,
            activation,
        })
    }

    pub fn num_params(&self) -> usize {
        self.up.num_params() + self.down.num_params()
    }

    pub(crate) fn try_forward<T: Tape<f32, D>>(
        &self,
        x: Hidden<D, T>,
    ) -> Result<Hidden<D, T>, D::Err> {
        let x = self.up.try_forward(x)?;
        let x = match self.activation {
            Activation::ReLU => x.try_relu()?,
            Activation::TanhGeLU => try_tanh_gelu(x)?,
        };
        self.down.try_forward(x)
    }
}

/// `0.5 * x * (1 + tanh(0.79788456 * (x + 0.044715 * x^3)))`
pub fn try_tanh_gelu<D: Device<f32>, T: Tape<f32, D>>(
    x: Hidden<D, T>,
) -> Result<Hidden<D, T>, D::Err> {
    let (x, tape) = x.split_tape();
    let inner = x
        .clone()
        .put_tape(tape)
        .try_square()?
        .try_mul(x.clone())?
        .try_mul(0.044715)?
        .try_add(x.clone())?
        .try_mul(0.79788456)?
        .try_tanh()?
        .try_add(1.)?;
    inner.try_mul(x)?.try_mul(0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_tanh_gelu_matches_closed_form() {
        let dev: Cpu = Default::default();
        let xs = vec![-3., -1., -0.5, 0., 0.5, 1., 3.];
        let x: Hidden<Cpu> = dev.tensor_from_vec(xs.clone(), (1, 1, 7));
        let y = try_tanh_gelu(x).unwrap().as_vec();
        for (x, y) in xs.iter().zip(y) {
            let expected: f32 =
                0.5 * x * (1. + (0.79788456f32 * (x + 0.044715 * x.powi(3))).tanh());
            assert!((expected - y).abs() < 1e-5, "gelu({x}) = {y}, expected {expected}");
        }
    }

    #[test]
    fn test_keeps_embedding_width() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        for activation in [Activation::ReLU, Activation::TanhGeLU] {
            let ff = FeedForward::try_new(&dev, 8, 32, activation, &mut rng).unwrap();
            assert_eq!(ff.num_params(), 8 * 32 + 32 + 32 * 8 + 8);
            let x: Hidden<Cpu> = dev.tensor_from_vec(vec![0.25; 2 * 5 * 8], (2, 5, 8));
            assert_eq!(*ff.try_forward(x).unwrap().shape(), (2, 5, 8));
        }
    }

    #[test]
    fn test_zero_hidden_width_is_a_config_error() {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            FeedForward::try_new(&dev, 8, 0, Activation::ReLU, &mut rng),
            Err(Error::Config(_))
        ));
    }
}
