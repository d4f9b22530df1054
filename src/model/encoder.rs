//! Pretrained encoder half.
//!
//! A bidirectional transformer encoder in the usual checkpoint layout:
//! `embed_tokens` / `embed_positions` / `layernorm_embedding` /
//! `layers.{i}.*`. The composed model treats it as an opaque differentiable
//! function from token ids to per-token hidden states.

use candle_core::{Module, Tensor};
use candle_nn::{Embedding, LayerNorm, VarBuilder};

use super::attention::{padding_bias, FeedForward, MultiHeadAttention};
use crate::config::TransformerConfig;
use crate::{Error, Result};

/// Diagnostic toggles for an encoder pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderOptions {
    /// Collect the hidden states after the embedding stage and every layer.
    pub output_hidden_states: bool,
    /// Collect per-layer attention probabilities.
    pub output_attentions: bool,
}

/// Result of an encoder pass.
pub struct EncoderOutput {
    /// Final per-token hidden states `[B, T, H]`.
    pub last_hidden_state: Tensor,
    /// Hidden states per stage, when requested.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Attention probabilities per layer, when requested.
    pub attentions: Option<Vec<Tensor>>,
}

/// Token + learned-position embeddings with a final LayerNorm.
///
/// Shared between the encoder and decoder halves; the decoder passes a
/// nonzero `offset` during incremental decoding so new tokens land on the
/// right positions.
pub struct TransformerEmbeddings {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layernorm_embedding: LayerNorm,
}

impl TransformerEmbeddings {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("embed_tokens"),
        )?;
        let embed_positions = candle_nn::embedding(
            config.max_position_embeddings,
            config.hidden_size,
            vb.pp("embed_positions"),
        )?;
        let layernorm_embedding = candle_nn::layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("layernorm_embedding"),
        )?;
        Ok(Self {
            embed_tokens,
            embed_positions,
            layernorm_embedding,
        })
    }

    /// Embed token ids `[B, T]` starting at position `offset`.
    pub fn forward(&self, input_ids: &Tensor, offset: usize) -> Result<Tensor> {
        let embeds = self.embed_tokens.forward(input_ids)?;
        self.forward_embeds(&embeds, offset)
    }

    /// Add position embeddings and normalize precomputed token embeddings
    /// `[B, T, H]`.
    pub fn forward_embeds(&self, inputs_embeds: &Tensor, offset: usize) -> Result<Tensor> {
        let seq_len = inputs_embeds.dim(1)?;
        let positions = Tensor::arange(
            offset as u32,
            (offset + seq_len) as u32,
            inputs_embeds.device(),
        )?;
        let position_embeds = self.embed_positions.forward(&positions)?;
        let hidden = inputs_embeds.broadcast_add(&position_embeds)?;
        hidden.apply(&self.layernorm_embedding).map_err(Into::into)
    }
}

struct EncoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_layer_norm: LayerNorm,
    feed_forward: FeedForward,
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = MultiHeadAttention::new(
            config.hidden_size,
            config.num_attention_heads,
            vb.pp("self_attn"),
        )?;
        let self_attn_layer_norm = candle_nn::layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("self_attn_layer_norm"),
        )?;
        let feed_forward =
            FeedForward::new(config.hidden_size, config.intermediate_size, vb.clone())?;
        let final_layer_norm = candle_nn::layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("final_layer_norm"),
        )?;
        Ok(Self {
            self_attn,
            self_attn_layer_norm,
            feed_forward,
            final_layer_norm,
        })
    }

    fn forward(
        &mut self,
        hidden_states: &Tensor,
        attention_bias: Option<&Tensor>,
        collect_probs: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (attn_out, probs) =
            self.self_attn
                .forward(hidden_states, None, attention_bias, false, collect_probs)?;
        let hidden = (hidden_states + attn_out)?.apply(&self.self_attn_layer_norm)?;
        let ffn_out = self.feed_forward.forward(&hidden)?;
        let hidden = (hidden + ffn_out)?.apply(&self.final_layer_norm)?;
        Ok((hidden, probs))
    }
}

/// The pretrained encoder.
pub struct TransformerEncoder {
    embeddings: TransformerEmbeddings,
    layers: Vec<EncoderLayer>,
    hidden_size: usize,
}

impl TransformerEncoder {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = TransformerEmbeddings::new(config, vb.clone())?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(EncoderLayer::new(config, vb.pp(format!("layers.{i}")))?);
        }
        Ok(Self {
            embeddings,
            layers,
            hidden_size: config.hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Encode a batch of sequences.
    ///
    /// Exactly one of `input_ids` `[B, T]` or `inputs_embeds` `[B, T, H]`
    /// must be supplied. `attention_mask` `[B, T]` marks real tokens with 1.
    pub fn forward(
        &mut self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        options: &EncoderOptions,
    ) -> Result<EncoderOutput> {
        let mut hidden = match (input_ids, inputs_embeds) {
            (_, Some(embeds)) => self.embeddings.forward_embeds(embeds, 0)?,
            (Some(ids), None) => self.embeddings.forward(ids, 0)?,
            (None, None) => {
                return Err(Error::Config(
                    "encoder needs input_ids or inputs_embeds".into(),
                ))
            }
        };

        let attention_bias = match attention_mask {
            Some(mask) => Some(padding_bias(mask, hidden.dtype())?),
            None => None,
        };

        let mut hidden_states = options.output_hidden_states.then(|| vec![hidden.clone()]);
        let mut attentions = options.output_attentions.then(Vec::new);

        for layer in self.layers.iter_mut() {
            let (next, probs) =
                layer.forward(&hidden, attention_bias.as_ref(), options.output_attentions)?;
            hidden = next;
            if let Some(collected) = hidden_states.as_mut() {
                collected.push(hidden.clone());
            }
            if let (Some(collected), Some(probs)) = (attentions.as_mut(), probs) {
                collected.push(probs);
            }
        }

        Ok(EncoderOutput {
            last_hidden_state: hidden,
            hidden_states,
            attentions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 100,
            hidden_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 64,
            max_position_embeddings: 64,
            ..TransformerConfig::default()
        }
    }

    #[test]
    fn encoder_output_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut encoder = TransformerEncoder::new(&tiny_config(), vb).unwrap();

        let input_ids = Tensor::zeros((2, 7), DType::U32, &device).unwrap();
        let out = encoder
            .forward(Some(&input_ids), None, None, &EncoderOptions::default())
            .unwrap();
        assert_eq!(out.last_hidden_state.dims(), &[2, 7, 32]);
        assert!(out.hidden_states.is_none());
        assert!(out.attentions.is_none());
    }

    #[test]
    fn encoder_collects_diagnostics() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut encoder = TransformerEncoder::new(&tiny_config(), vb).unwrap();

        let input_ids = Tensor::zeros((1, 5), DType::U32, &device).unwrap();
        let options = EncoderOptions {
            output_hidden_states: true,
            output_attentions: true,
        };
        let out = encoder
            .forward(Some(&input_ids), None, None, &options)
            .unwrap();
        // Embedding stage + 2 layers.
        assert_eq!(out.hidden_states.unwrap().len(), 3);
        let attentions = out.attentions.unwrap();
        assert_eq!(attentions.len(), 2);
        assert_eq!(attentions[0].dims(), &[1, 2, 5, 5]);
    }

    #[test]
    fn encoder_accepts_precomputed_embeddings() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut encoder = TransformerEncoder::new(&tiny_config(), vb).unwrap();

        let embeds = Tensor::randn(0f32, 1.0, (1, 4, 32), &device).unwrap();
        let out = encoder
            .forward(None, Some(&embeds), None, &EncoderOptions::default())
            .unwrap();
        assert_eq!(out.last_hidden_state.dims(), &[1, 4, 32]);
    }

    #[test]
    fn encoder_rejects_missing_inputs() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut encoder = TransformerEncoder::new(&tiny_config(), vb).unwrap();

        let err = encoder
            .forward(None, None, None, &EncoderOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn padding_mask_changes_nothing_for_all_ones() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut encoder = TransformerEncoder::new(&tiny_config(), vb).unwrap();

        let input_ids = Tensor::zeros((1, 4), DType::U32, &device).unwrap();
        let mask = Tensor::ones((1, 4), DType::U32, &device).unwrap();
        let with_mask = encoder
            .forward(
                Some(&input_ids),
                None,
                Some(&mask),
                &EncoderOptions::default(),
            )
            .unwrap();
        let without = encoder
            .forward(Some(&input_ids), None, None, &EncoderOptions::default())
            .unwrap();
        let diff = (with_mask.last_hidden_state - without.last_hidden_state)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }
}
