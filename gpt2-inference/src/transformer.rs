#[cfg(test)]
#[path = "../tests/unit/transformer_test.rs"]
mod tests;

use crate::configuration::HyperParams;
use crate::engine::MatrixEngine;
use crate::error::{Error, Result};
use crate::layers::{Block, LAYER_NORM_EPS, LayerNormParams, embed, layer_norm, transformer_block};
use crate::tensor::Matrix;
use log::debug;

/// The deserialized model.
///
/// `wte_t` is the transpose of `wte`, computed once so the output projection does not
/// transpose the embedding table on every forward pass.
#[derive(Clone)]
pub struct ParameterSet {
    pub wte: Matrix,
    pub wte_t: Matrix,
    pub wpe: Matrix,
    pub blocks: Vec<Block>,
    pub ln_f: LayerNormParams,
}

impl ParameterSet {
    /// Assembles a parameter set, deriving `wte_t` from `wte`.
    pub fn new(wte: Matrix, wpe: Matrix, blocks: Vec<Block>, ln_f: LayerNormParams) -> Self {
        let wte_t = wte.transpose();
        Self { wte, wte_t, wpe, blocks, ln_f }
    }

    /// Checks that every table matches `hparams`.
    pub fn check_shapes(&self, hparams: &HyperParams) -> Result<()> {
        let expect = |op: &'static str, actual: (usize, usize), expected: (usize, usize)| {
            if actual == expected {
                Ok(())
            } else {
                Err(Error::DimensionMismatch { op, left: actual, right: expected })
            }
        };

        let e = hparams.n_embd;
        expect("wte", self.wte.shape(), (hparams.n_vocab, e))?;
        expect("wte_t", self.wte_t.shape(), (e, hparams.n_vocab))?;
        expect("wpe", self.wpe.shape(), (hparams.n_ctx, e))?;
        expect("ln_f", (self.ln_f.gain.len(), self.ln_f.bias.len()), (e, e))?;

        if self.blocks.len() != hparams.n_layer {
            return Err(Error::Config(format!(
                "parameter set has {} blocks, expected {}",
                self.blocks.len(),
                hparams.n_layer
            )));
        }

        for block in &self.blocks {
            expect("c_attn", block.attn.c_attn.weight.shape(), (e, 3 * e))?;
            expect("attn.c_proj", block.attn.c_proj.weight.shape(), (e, e))?;
            expect("c_fc", block.mlp.c_fc.weight.shape(), (e, 4 * e))?;
            expect("mlp.c_proj", block.mlp.c_proj.weight.shape(), (4 * e, e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("wte", &self.wte)
            .field("wpe", &self.wpe)
            .field("blocks", &self.blocks.len())
            .field("ln_f", &self.ln_f.gain.len())
            .finish()
    }
}

/// GPT-2 decoder stack.
///
/// Every call to [`Transformer::forward`] recomputes the whole sequence: there is no key/value
/// cache, so the cost of one step grows with the context length.
pub struct Transformer {
    params: ParameterSet,
    hparams: HyperParams,
    engine: MatrixEngine,
}

impl Transformer {
    /// Validates `hparams` and the parameter shapes against them.
    pub fn new(params: ParameterSet, hparams: HyperParams, engine: MatrixEngine) -> Result<Self> {
        hparams.validate()?;
        params.check_shapes(&hparams)?;
        debug!("Transformer ready: {hparams:?}");
        Ok(Self { params, hparams, engine })
    }

    pub fn hparams(&self) -> &HyperParams {
        &self.hparams
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn engine(&self) -> &MatrixEngine {
        &self.engine
    }

    /// Computes logits (`len(input_ids) x n_vocab`) for every position of `input_ids`.
    ///
    /// `on_layer_done` is called with the block index after each block completes.
    pub fn forward(&self, input_ids: &[usize], on_layer_done: &mut dyn FnMut(usize)) -> Result<Matrix> {
        if input_ids.is_empty() {
            return Err(Error::Config("forward pass needs at least one token".to_string()));
        }

        let mut x = embed(&self.params.wte, &self.params.wpe, input_ids)?;

        for (layer, block) in self.params.blocks.iter().enumerate() {
            x = transformer_block(&self.engine, &x, block, self.hparams.n_head)?;
            on_layer_done(layer);
        }

        let x = layer_norm(&x, &self.params.ln_f, LAYER_NORM_EPS)?;
        self.engine.multiply(&x, &self.params.wte_t)
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("hparams", &self.hparams)
            .field("params", &self.params)
            .field("gpu", &self.engine.compute().is_gpu_available())
            .finish()
    }
}
