use crate::error::{Error, Result};

/// Architecture hyperparameters of a GPT-2 style model.
///
/// The runtime always uses [`HyperParams::GPT2_124M`]; other values only exist so that
/// tiny stub models can be built for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HyperParams {
    pub n_vocab: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
}

impl HyperParams {
    /// The 124M parameter GPT-2 checkpoint.
    pub const GPT2_124M: HyperParams = HyperParams { n_vocab: 50257, n_ctx: 1024, n_embd: 768, n_head: 12, n_layer: 12 };

    /// Validates the dimensions so that heads split the embedding evenly.
    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("n_vocab", self.n_vocab),
            ("n_ctx", self.n_ctx),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
        ];

        for (name, value) in dimensions {
            if value == 0 {
                return Err(Error::Config(format!("invalid {name}: must be positive")));
            }
        }

        if self.n_embd % self.n_head != 0 {
            return Err(Error::Config(format!(
                "n_embd ({}) is not divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }

        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Number of floats in one block of the raw weight stream.
    pub fn block_weight_count(&self) -> usize {
        let e = self.n_embd;
        // c_attn (3E + E*3E), attn c_proj (E + E*E), ln_1 + ln_2 (4E),
        // c_fc (4E + E*4E), mlp c_proj (E + 4E*E)
        12 * e * e + 13 * e
    }

    /// Number of floats the raw weight stream must contain.
    pub fn expected_weight_count(&self) -> usize {
        self.n_layer * self.block_weight_count() + 2 * self.n_embd + (self.n_ctx + self.n_vocab) * self.n_embd
    }
}

impl Default for HyperParams {
    fn default() -> Self {
        Self::GPT2_124M
    }
}
