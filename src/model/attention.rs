//! Attention building blocks for the encoder/decoder halves.
//!
//! One [`MultiHeadAttention`] module covers all three attention flavors:
//! - bidirectional self-attention (encoder)
//! - causal self-attention with a KV cache (decoder, incremental decoding)
//! - cross-attention over caller-supplied context states (decoder)
//!
//! Masks are additive 4D biases with `0.0` for visible positions and
//! `f32::MIN` for masked ones; combined masks use elementwise minimum so
//! stacking two biases cannot overflow to `-inf`.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::{Error, Result};

/// Causal (lower-triangular) additive mask `[1, 1, T, T]`.
pub fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut mask = vec![0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask[i * seq_len + j] = f32::MIN;
        }
    }
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?;
    mask.to_dtype(dtype).map_err(Into::into)
}

/// Convert a `[B, T]` padding mask (1 = token, 0 = padding) into an additive
/// bias `[B, 1, 1, T]`.
pub fn padding_bias(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let inverted = attention_mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)?;
    let bias = (inverted * f64::from(f32::MIN))?;
    bias.unsqueeze(1)?.unsqueeze(1)?.to_dtype(dtype).map_err(Into::into)
}

/// Multi-head scaled dot-product attention.
///
/// `kv_states` selects the flavor: `None` attends over the query states
/// themselves (self-attention), `Some` attends over the supplied context
/// (cross-attention). With `use_cache`, new key/value projections are
/// appended to the layer cache so single-token decoding steps see the full
/// history.
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl MultiHeadAttention {
    pub fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if hidden_size % num_heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {hidden_size} is not divisible by num_attention_heads {num_heads}"
            )));
        }
        let q_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("v_proj"))?;
        let o_proj = candle_nn::linear(hidden_size, hidden_size, vb.pp("o_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            head_dim: hidden_size / num_heads,
            kv_cache: None,
        })
    }

    /// Drop cached key/value states. Must be called between independent
    /// decoding passes.
    pub fn clear_kv_cache(&mut self) {
        self.kv_cache = None;
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, T_q, H]` — query states
    /// - `kv_states`: `[B, T_kv, H]` — key/value source (`None` = self)
    /// - `attention_bias`: additive mask broadcastable to `[B, h, T_q, T_kv]`
    /// - `use_cache`: append projected k/v to the layer cache
    /// - `collect_probs`: also return the post-softmax attention weights
    ///
    /// Returns `([B, T_q, H], Option<[B, h, T_q, T_kv]>)`.
    pub fn forward(
        &mut self,
        hidden_states: &Tensor,
        kv_states: Option<&Tensor>,
        attention_bias: Option<&Tensor>,
        use_cache: bool,
        collect_probs: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (batch, q_len, _) = hidden_states.dims3()?;
        let kv_input = kv_states.unwrap_or(hidden_states);
        let kv_len = kv_input.dim(1)?;

        let q = hidden_states
            .apply(&self.q_proj)?
            .reshape((batch, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = kv_input
            .apply(&self.k_proj)?
            .reshape((batch, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = kv_input
            .apply(&self.v_proj)?
            .reshape((batch, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (k, v) = if use_cache {
            let (k, v) = match self.kv_cache.take() {
                Some((prev_k, prev_v)) => (
                    Tensor::cat(&[&prev_k, &k], 2)?,
                    Tensor::cat(&[&prev_v, &v], 2)?,
                ),
                None => (k, v),
            };
            self.kv_cache = Some((k.clone(), v.clone()));
            (k, v)
        } else {
            (k, v)
        };

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let scores = match attention_bias {
            Some(bias) => scores.broadcast_add(&bias.to_dtype(scores.dtype())?)?,
            None => scores,
        };

        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * self.head_dim))?;
        let out = context.apply(&self.o_proj)?;
        Ok((out, collect_probs.then_some(probs)))
    }
}

/// Position-wise feed-forward block: linear → GELU → linear.
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = candle_nn::linear(hidden_size, intermediate_size, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(intermediate_size, hidden_size, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        hidden_states
            .apply(&self.fc1)?
            .gelu()?
            .apply(&self.fc2)
            .map_err(Into::into)
    }
}
