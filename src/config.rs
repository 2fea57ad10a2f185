use crate::error::ConfigError;

/// Nonlinearity between the two feed-forward projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    ReLU,
    /// Tanh approximation of GeLU.
    TanhGeLU,
}

/// Hyperparameters of the encoder-decoder model.
///
/// Built once and handed by reference to every sublayer constructor. Defaults match
/// `embed_size=512, heads=8, dropout=0, forward_expansion=4, num_layers=6, max_length=100`
/// with padding index 0 on both sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformerConfig {
    pub embed_size: usize,
    pub heads: usize,
    pub dropout: f32,
    pub forward_expansion: usize,
    pub src_vocab_size: usize,
    pub trg_vocab_size: usize,
    pub src_pad_idx: usize,
    pub trg_pad_idx: usize,
    pub num_layers: usize,
    pub max_length: usize,
    pub activation: Activation,
    /// Seed for parameter initialization.
    pub seed: u64,
}

impl TransformerConfig {
    pub fn new(src_vocab_size: usize, trg_vocab_size: usize) -> Self {
        Self {
            embed_size: 512,
            heads: 8,
            dropout: 0.,
            forward_expansion: 4,
            src_vocab_size,
            trg_vocab_size,
            src_pad_idx: 0,
            trg_pad_idx: 0,
            num_layers: 6,
            max_length: 100,
            activation: Activation::ReLU,
            seed: 0,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.embed_size / self.heads.max(1)
    }

    pub fn ff_dim(&self) -> usize {
        self.forward_expansion * self.embed_size
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_heads(self.embed_size, self.heads)?;
        if self.forward_expansion == 0 {
            return Err(ConfigError::Invalid(
                "forward_expansion must be at least 1".into(),
            ));
        }
        if self.num_layers == 0 {
            return Err(ConfigError::Invalid("num_layers must be at least 1".into()));
        }
        if self.max_length == 0 {
            return Err(ConfigError::Invalid("max_length must be at least 1".into()));
        }
        for (name, vocab, pad) in [
            ("src", self.src_vocab_size, self.src_pad_idx),
            ("trg", self.trg_vocab_size, self.trg_pad_idx),
        ] {
            if vocab == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}_vocab_size must be at least 1"
                )));
            }
            if pad >= vocab {
                return Err(ConfigError::Invalid(format!(
                    "{name}_pad_idx {pad} is outside the vocabulary of {vocab}"
                )));
            }
        }
        if !(0. ..1.).contains(&self.dropout) {
            return Err(ConfigError::Invalid(format!(
                "dropout {} must be in [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }
}

pub(crate) fn check_heads(embed_size: usize, heads: usize) -> Result<(), ConfigError> {
    if heads == 0 {
        return Err(ConfigError::ZeroHeads);
    }
    if embed_size == 0 || embed_size % heads != 0 {
        return Err(ConfigError::HeadsDoNotDivide { embed_size, heads });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = TransformerConfig::new(10, 10);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.head_dim() * cfg.heads, cfg.embed_size);
        assert_eq!(cfg.ff_dim(), 2048);
    }

    #[test]
    fn test_head_dim_times_heads_is_embed_size() {
        for (embed_size, heads) in [(8, 1), (8, 2), (12, 3), (64, 8), (512, 16)] {
            let cfg = TransformerConfig {
                embed_size,
                heads,
                ..TransformerConfig::new(4, 4)
            };
            assert!(cfg.validate().is_ok());
            assert_eq!(cfg.head_dim() * heads, embed_size);
        }
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let cfg = TransformerConfig {
            embed_size: 10,
            heads: 3,
            ..TransformerConfig::new(4, 4)
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::HeadsDoNotDivide {
                embed_size: 10,
                heads: 3
            })
        );
        let cfg = TransformerConfig {
            heads: 0,
            ..TransformerConfig::new(4, 4)
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroHeads));
    }

    #[test]
    fn test_bad_pad_and_dropout_rejected() {
        let cfg = TransformerConfig {
            src_pad_idx: 4,
            ..TransformerConfig::new(4, 4)
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        let cfg = TransformerConfig {
            dropout: 1.,
            ..TransformerConfig::new(4, 4)
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
