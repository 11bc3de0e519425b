#[cfg(test)]
#[path = "../tests/unit/loader_test.rs"]
mod tests;

use crate::configuration::HyperParams;
use crate::error::{Error, Result};
use crate::layers::{AttentionParams, Block, LayerNormParams, LinearParams, MlpParams};
use crate::tensor::Matrix;
use crate::transformer::ParameterSet;
use gpt2_weights::{BlobStore, WeightSource, WeightsError, bytes_to_f32};
use log::{debug, info, warn};
use std::time::Instant;

/// Sequential reader over the raw weight stream.
struct WeightCursor<'a> {
    values: &'a [f32],
    offset: usize,
}

impl<'a> WeightCursor<'a> {
    fn new(values: &'a [f32]) -> Self {
        Self { values, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [f32]> {
        let end = self.offset + count;
        if end > self.values.len() {
            return Err(Error::CorruptWeightStream { expected: end, actual: self.values.len() });
        }

        let slice = &self.values[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn vector(&mut self, count: usize) -> Result<Vec<f32>> {
        Ok(self.take(count)?.to_vec())
    }

    fn matrix(&mut self, rows: usize, cols: usize) -> Result<Matrix> {
        Matrix::from_flat(rows, cols, self.vector(rows * cols)?)
    }

    /// Reads bias then weight rows.
    fn linear(&mut self, rows: usize, cols: usize) -> Result<LinearParams> {
        let bias = self.vector(cols)?;
        let weight = self.matrix(rows, cols)?;
        Ok(LinearParams { weight, bias })
    }

    /// Reads bias then gain.
    fn layer_norm(&mut self, width: usize) -> Result<LayerNormParams> {
        let bias = self.vector(width)?;
        let gain = self.vector(width)?;
        Ok(LayerNormParams { gain, bias })
    }

    fn block(&mut self, e: usize) -> Result<Block> {
        let c_attn = self.linear(e, 3 * e)?;
        let attn_proj = self.linear(e, e)?;
        let ln_1 = self.layer_norm(e)?;
        let ln_2 = self.layer_norm(e)?;
        let c_fc = self.linear(e, 4 * e)?;
        let mlp_proj = self.linear(4 * e, e)?;

        Ok(Block {
            attn: AttentionParams { c_attn, c_proj: attn_proj },
            ln_1,
            ln_2,
            mlp: MlpParams { c_fc, c_proj: mlp_proj },
        })
    }
}

/// Layer index of each block in stream order.
///
/// Blocks are stored sorted by their layer name (`h0`, `h1`, `h10`, ...), so for 12 layers the
/// stream holds layers `[0, 1, 10, 11, 2, 3, ..., 9]`.
pub fn block_order(n_layer: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n_layer).collect();
    order.sort_by_cached_key(|layer| format!("h{layer}"));
    order
}

/// Rebuilds a [`ParameterSet`] from the raw weight stream.
///
/// Fails with [`Error::CorruptWeightStream`] unless `values` holds exactly
/// [`HyperParams::expected_weight_count`] floats.
pub fn deserialize(values: &[f32], hparams: &HyperParams) -> Result<ParameterSet> {
    hparams.validate()?;

    let expected = hparams.expected_weight_count();
    if values.len() != expected {
        return Err(Error::CorruptWeightStream { expected, actual: values.len() });
    }

    let e = hparams.n_embd;
    let mut cursor = WeightCursor::new(values);

    let mut slots: Vec<Option<Block>> = vec![None; hparams.n_layer];
    for layer in block_order(hparams.n_layer) {
        slots[layer] = Some(cursor.block(e)?);
    }
    let blocks = slots.into_iter().flatten().collect();

    let ln_f = cursor.layer_norm(e)?;
    let wpe = cursor.matrix(hparams.n_ctx, e)?;
    let wte = cursor.matrix(hparams.n_vocab, e)?;

    debug!("Deserialized {} floats into {} blocks", cursor.offset, hparams.n_layer);
    Ok(ParameterSet::new(wte, wpe, blocks, ln_f))
}

/// Loads model parameters from a persistent store, falling back to a [`WeightSource`].
///
/// A downloaded blob is validated before it is persisted, so the store only ever holds a
/// payload of the expected length. A blob already in the store that fails validation is
/// reported as [`Error::CorruptWeightStream`]; clearing it is left to the caller.
pub struct WeightLoader<S, B> {
    source: S,
    store: B,
    hparams: HyperParams,
}

impl<S: WeightSource, B: BlobStore> WeightLoader<S, B> {
    pub fn new(source: S, store: B, hparams: HyperParams) -> Self {
        Self { source, store, hparams }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    /// Returns the parameters, downloading and caching them on a cache miss.
    ///
    /// `on_progress` receives download percentages; it is not called on a cache hit.
    pub fn load(&mut self, on_progress: &mut dyn FnMut(u8)) -> Result<ParameterSet> {
        let values = self.load_raw(on_progress)?;

        let start = Instant::now();
        let params = deserialize(&values, &self.hparams)?;
        info!("🧩 Parameters ready in {:.2}s", start.elapsed().as_secs_f64());
        Ok(params)
    }

    /// Returns the raw weight stream, from the store when present.
    pub fn load_raw(&mut self, on_progress: &mut dyn FnMut(u8)) -> Result<Vec<f32>> {
        match self.store.get() {
            Ok(values) => {
                info!("📂 Loaded {} cached weights", values.len());
                return Ok(values);
            }
            Err(WeightsError::CacheMiss) => info!("Weights not cached, downloading"),
            Err(e) => warn!("Failed to read cached weights, downloading instead: {e}"),
        }

        let values = self.fetch(on_progress)?;

        if let Err(e) = self.store.put(&values) {
            warn!("Continuing without a cache: {e}");
        }
        Ok(values)
    }

    fn fetch(&self, on_progress: &mut dyn FnMut(u8)) -> Result<Vec<f32>> {
        let bytes = self.source.fetch(on_progress)?;
        let values = bytes_to_f32(&bytes)?;

        let expected = self.hparams.expected_weight_count();
        if values.len() != expected {
            return Err(Error::CorruptWeightStream { expected, actual: values.len() });
        }
        Ok(values)
    }

    /// Removes the cached blob, if any.
    pub fn clear(&mut self) -> Result<()> {
        Ok(self.store.delete()?)
    }

    /// Reports whether a cached blob is present without reading it.
    pub fn exists(&self) -> Result<bool> {
        Ok(self.store.exists()?)
    }
}

impl<S, B> std::fmt::Debug for WeightLoader<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightLoader").field("hparams", &self.hparams).finish_non_exhaustive()
    }
}
