#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod tests;

use crate::engine::MatrixEngine;
use crate::error::{Error, Result};
use crate::tensor::Matrix;

/// Epsilon value for numerical stability in layer normalization
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Additive mask value for positions a token may not attend to.
pub const MASK_VALUE: f32 = -1e10;

/// Gain and bias of a layer normalization.
#[derive(Debug, Clone)]
pub struct LayerNormParams {
    pub gain: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Weight (`in x out`) and bias (`out`) of an affine projection.
#[derive(Debug, Clone)]
pub struct LinearParams {
    pub weight: Matrix,
    pub bias: Vec<f32>,
}

/// Attention projections: `c_attn` maps to query/key/value, `c_proj` merges heads back.
#[derive(Debug, Clone)]
pub struct AttentionParams {
    pub c_attn: LinearParams,
    pub c_proj: LinearParams,
}

/// Feed-forward projections: `c_fc` expands, `c_proj` contracts.
#[derive(Debug, Clone)]
pub struct MlpParams {
    pub c_fc: LinearParams,
    pub c_proj: LinearParams,
}

/// Parameters of one transformer layer.
#[derive(Debug, Clone)]
pub struct Block {
    pub attn: AttentionParams,
    pub ln_1: LayerNormParams,
    pub ln_2: LayerNormParams,
    pub mlp: MlpParams,
}

/// Normalizes every row to zero mean and unit variance, then scales by `gain` and shifts by `bias`.
///
/// ```text
/// LayerNorm(x) = g * (x - mean(x)) / sqrt(var(x) + eps) + b
/// ```
pub fn layer_norm(x: &Matrix, params: &LayerNormParams, eps: f32) -> Result<Matrix> {
    if params.gain.len() != x.cols() || params.bias.len() != x.cols() {
        return Err(Error::DimensionMismatch {
            op: "layer_norm",
            left: x.shape(),
            right: (params.gain.len(), params.bias.len()),
        });
    }

    let mut out = x.clone();
    for i in 0..out.rows() {
        let row = out.row_mut(i);
        let n = row.len() as f32;
        let mean = row.iter().sum::<f32>() / n;
        let variance = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv_std = (variance + eps).sqrt().recip();

        row.iter_mut()
            .zip(params.gain.iter().zip(&params.bias))
            .for_each(|(val, (&g, &b))| *val = g * ((*val - mean) * inv_std) + b);
    }
    Ok(out)
}

/// GELU, tanh approximation:
/// `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))`.
pub fn gelu(x: &Matrix) -> Matrix {
    let coeff = (2.0f32 / std::f32::consts::PI).sqrt();
    x.map(|v| 0.5 * v * (1.0 + (coeff * (v + 0.044715 * v.powi(3))).tanh()))
}

// Applies softmax normalization to a slice in-place.
pub(crate) fn softmax_in_place(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    x.iter_mut().for_each(|val| *val /= sum);
}

/// Row-wise softmax.
pub fn softmax(x: &Matrix) -> Matrix {
    let mut out = x.clone();
    (0..out.rows()).for_each(|i| softmax_in_place(out.row_mut(i)));
    out
}

/// `x * w + b`, with the bias broadcast across rows.
pub fn linear(engine: &MatrixEngine, x: &Matrix, params: &LinearParams) -> Result<Matrix> {
    let mut out = engine.multiply(x, &params.weight)?;
    out.add_row_broadcast(&params.bias)?;
    Ok(out)
}

/// Square causal mask: `0` where `j <= i`, [`MASK_VALUE`] where `j > i`.
pub fn causal_mask(n: usize) -> Matrix {
    let mut mask = Matrix::zeros(n, n);
    for i in 0..n {
        mask.row_mut(i)[i + 1..].fill(MASK_VALUE);
    }
    mask
}

/// Attention weights `softmax(q * k^T / sqrt(d) + mask)`.
pub fn attention_weights(engine: &MatrixEngine, q: &Matrix, k: &Matrix, mask: &Matrix) -> Result<Matrix> {
    let scores = engine.multiply(q, &engine.transpose(k))?;
    let scale = (q.cols() as f32).sqrt();
    let scaled = scores.map(|v| v / scale);
    let masked = scaled.add(mask)?;
    Ok(softmax(&masked))
}

/// Scaled dot-product attention `softmax(q * k^T / sqrt(d) + mask) * v`.
pub fn attention(engine: &MatrixEngine, q: &Matrix, k: &Matrix, v: &Matrix, mask: &Matrix) -> Result<Matrix> {
    let weights = attention_weights(engine, q, k, mask)?;
    engine.multiply(&weights, v)
}

/// Splits `x` into `n` equal-width column groups, in order.
pub fn split_columns(x: &Matrix, n: usize) -> Result<Vec<Matrix>> {
    if n == 0 || x.cols() % n != 0 {
        return Err(Error::Config(format!("cannot split {} columns into {n} equal parts", x.cols())));
    }

    let width = x.cols() / n;
    Ok((0..n).map(|i| x.column_slice(i * width, (i + 1) * width)).collect())
}

/// Concatenates matrices with equal row counts along the column axis.
pub fn concat_columns(parts: &[Matrix]) -> Result<Matrix> {
    let rows = parts.first().map_or(0, Matrix::rows);
    if let Some(bad) = parts.iter().find(|p| p.rows() != rows) {
        return Err(Error::DimensionMismatch { op: "concat_columns", left: (rows, 0), right: bad.shape() });
    }

    let cols = parts.iter().map(Matrix::cols).sum();
    let mut data = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for part in parts {
            data.extend_from_slice(part.row(i));
        }
    }
    Matrix::from_flat(rows, cols, data)
}

/// Multi-head causal self-attention.
///
/// Projects to `3 * n_embd`, splits into query/key/value, splits each into `n_head` heads,
/// attends per head, merges heads in order and projects back.
pub fn multi_head_attention(
    engine: &MatrixEngine,
    x: &Matrix,
    attn: &AttentionParams,
    n_head: usize,
) -> Result<Matrix> {
    let projected = linear(engine, x, &attn.c_attn)?;
    let qkv = split_columns(&projected, 3)?;

    let q_heads = split_columns(&qkv[0], n_head)?;
    let k_heads = split_columns(&qkv[1], n_head)?;
    let v_heads = split_columns(&qkv[2], n_head)?;

    let mask = causal_mask(x.rows());

    // Heads are independent; they run in order so device dispatches never overlap.
    let out_heads = q_heads
        .iter()
        .zip(&k_heads)
        .zip(&v_heads)
        .map(|((q, k), v)| attention(engine, q, k, v, &mask))
        .collect::<Result<Vec<_>>>()?;

    let merged = concat_columns(&out_heads)?;
    linear(engine, &merged, &attn.c_proj)
}

/// `linear(gelu(linear(x, c_fc)), c_proj)`.
pub fn feed_forward(engine: &MatrixEngine, x: &Matrix, mlp: &MlpParams) -> Result<Matrix> {
    let hidden = gelu(&linear(engine, x, &mlp.c_fc)?);
    linear(engine, &hidden, &mlp.c_proj)
}

/// Pre-norm transformer layer with residual connections around attention and feed-forward.
pub fn transformer_block(engine: &MatrixEngine, x: &Matrix, block: &Block, n_head: usize) -> Result<Matrix> {
    let attn_out = multi_head_attention(engine, &layer_norm(x, &block.ln_1, LAYER_NORM_EPS)?, &block.attn, n_head)?;
    let h = x.add(&attn_out)?;

    let ffn_out = feed_forward(engine, &layer_norm(&h, &block.ln_2, LAYER_NORM_EPS)?, &block.mlp)?;
    h.add(&ffn_out)
}

/// Sum of token and position embeddings for each input position.
pub fn embed(wte: &Matrix, wpe: &Matrix, input_ids: &[usize]) -> Result<Matrix> {
    if wte.cols() != wpe.cols() {
        return Err(Error::DimensionMismatch { op: "embed", left: wte.shape(), right: wpe.shape() });
    }
    if input_ids.len() > wpe.rows() {
        return Err(Error::Config(format!(
            "{} positions exceed the context window of {}",
            input_ids.len(),
            wpe.rows()
        )));
    }
    if let Some(&bad) = input_ids.iter().find(|&&id| id >= wte.rows()) {
        return Err(Error::Tokenizer(format!("token id {bad} is outside the vocabulary of {}", wte.rows())));
    }

    let mut out = Matrix::zeros(input_ids.len(), wte.cols());
    for (pos, &id) in input_ids.iter().enumerate() {
        out.row_mut(pos)
            .iter_mut()
            .zip(wte.row(id).iter().zip(wpe.row(pos)))
            .for_each(|(val, (t, p))| *val = t + p);
    }
    Ok(out)
}
