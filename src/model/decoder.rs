//! Pretrained decoder half.
//!
//! A causal transformer decoder with cross-attention over caller-supplied
//! context states and an LM head projecting to the vocabulary. The
//! cross-attention context is whatever the composed model hands in — in this
//! crate that is always the bottleneck's reconstruction, never the raw
//! encoder states.
//!
//! Each layer's causal self-attention keeps a KV cache so generation feeds
//! one token per step; call [`TransformerDecoder::clear_kv_cache`] between
//! independent passes.

use candle_core::Tensor;
use candle_nn::{LayerNorm, Linear, VarBuilder};

use super::attention::{causal_mask, padding_bias, FeedForward, MultiHeadAttention};
use super::encoder::TransformerEmbeddings;
use crate::config::TransformerConfig;
use crate::Result;

/// Diagnostic toggles for a decoder pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions {
    /// Collect the hidden states after the embedding stage and every layer.
    pub output_hidden_states: bool,
    /// Collect per-layer self- and cross-attention probabilities.
    pub output_attentions: bool,
}

/// Result of a decoder pass.
pub struct DecoderOutput {
    /// Vocabulary logits `[B, T, vocab_size]`.
    pub logits: Tensor,
    /// Hidden states per stage, when requested.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Self-attention probabilities per layer, when requested.
    pub attentions: Option<Vec<Tensor>>,
    /// Cross-attention probabilities per layer, when requested.
    pub cross_attentions: Option<Vec<Tensor>>,
}

struct DecoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_layer_norm: LayerNorm,
    cross_attn: MultiHeadAttention,
    cross_attn_layer_norm: LayerNorm,
    feed_forward: FeedForward,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
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
        let cross_attn = MultiHeadAttention::new(
            config.hidden_size,
            config.num_attention_heads,
            vb.pp("encoder_attn"),
        )?;
        let cross_attn_layer_norm = candle_nn::layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("encoder_attn_layer_norm"),
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
            cross_attn,
            cross_attn_layer_norm,
            feed_forward,
            final_layer_norm,
        })
    }

    #[allow(clippy::type_complexity)]
    fn forward(
        &mut self,
        hidden_states: &Tensor,
        encoder_hidden_states: &Tensor,
        self_attention_bias: Option<&Tensor>,
        cross_attention_bias: Option<&Tensor>,
        collect_probs: bool,
    ) -> Result<(Tensor, Option<Tensor>, Option<Tensor>)> {
        let (attn_out, self_probs) = self.self_attn.forward(
            hidden_states,
            None,
            self_attention_bias,
            true,
            collect_probs,
        )?;
        let hidden = (hidden_states + attn_out)?.apply(&self.self_attn_layer_norm)?;

        let (cross_out, cross_probs) = self.cross_attn.forward(
            &hidden,
            Some(encoder_hidden_states),
            cross_attention_bias,
            false,
            collect_probs,
        )?;
        let hidden = (hidden + cross_out)?.apply(&self.cross_attn_layer_norm)?;

        let ffn_out = self.feed_forward.forward(&hidden)?;
        let hidden = (hidden + ffn_out)?.apply(&self.final_layer_norm)?;
        Ok((hidden, self_probs, cross_probs))
    }

    fn clear_kv_cache(&mut self) {
        self.self_attn.clear_kv_cache();
    }
}

/// The pretrained decoder.
pub struct TransformerDecoder {
    embeddings: TransformerEmbeddings,
    layers: Vec<DecoderLayer>,
    lm_head: Linear,
    vocab_size: usize,
}

impl TransformerDecoder {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = TransformerEmbeddings::new(config, vb.clone())?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::new(config, vb.pp(format!("layers.{i}")))?);
        }
        let lm_head =
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            embeddings,
            layers,
            lm_head,
            vocab_size: config.vocab_size,
        })
    }

    /// Width of the logit output.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Drop all cached key/value states. Must be called between independent
    /// decoding passes.
    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear_kv_cache();
        }
    }

    /// Run the decoder.
    ///
    /// - `input_ids`: `[B, T]` decoder token ids
    /// - `encoder_hidden_states`: `[B, T_enc, H]` cross-attention context
    /// - `encoder_attention_mask`: `[B, T_enc]` padding mask for the context
    /// - `attention_mask`: `[B, T]` padding mask for the decoder tokens
    /// - `offset`: index of the first position in `input_ids`; nonzero during
    ///   incremental decoding, where earlier positions live in the KV cache
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_attention_mask: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        offset: usize,
        options: &DecoderOptions,
    ) -> Result<DecoderOutput> {
        let seq_len = input_ids.dim(1)?;
        let mut hidden = self.embeddings.forward(input_ids, offset)?;
        let dtype = hidden.dtype();

        // Single-token incremental steps attend over the whole cache, so the
        // causal mask only matters for multi-token inputs.
        let self_attention_bias = if seq_len > 1 {
            let causal = causal_mask(seq_len, dtype, hidden.device())?;
            match attention_mask {
                Some(mask) => Some(causal.broadcast_minimum(&padding_bias(mask, dtype)?)?),
                None => Some(causal),
            }
        } else {
            None
        };

        let cross_attention_bias = match encoder_attention_mask {
            Some(mask) => Some(padding_bias(mask, dtype)?),
            None => None,
        };

        let mut hidden_states = options.output_hidden_states.then(|| vec![hidden.clone()]);
        let mut attentions = options.output_attentions.then(Vec::new);
        let mut cross_attentions = options.output_attentions.then(Vec::new);

        for layer in self.layers.iter_mut() {
            let (next, self_probs, cross_probs) = layer.forward(
                &hidden,
                encoder_hidden_states,
                self_attention_bias.as_ref(),
                cross_attention_bias.as_ref(),
                options.output_attentions,
            )?;
            hidden = next;
            if let Some(collected) = hidden_states.as_mut() {
                collected.push(hidden.clone());
            }
            if let (Some(collected), Some(probs)) = (attentions.as_mut(), self_probs) {
                collected.push(probs);
            }
            if let (Some(collected), Some(probs)) = (cross_attentions.as_mut(), cross_probs) {
                collected.push(probs);
            }
        }

        let logits = hidden.apply(&self.lm_head)?;
        Ok(DecoderOutput {
            logits,
            hidden_states,
            attentions,
            cross_attentions,
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
    fn decoder_logits_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut decoder = TransformerDecoder::new(&tiny_config(), vb).unwrap();
        assert_eq!(decoder.vocab_size(), 100);

        let input_ids = Tensor::zeros((2, 6), DType::U32, &device).unwrap();
        let context = Tensor::randn(0f32, 1.0, (2, 8, 32), &device).unwrap();
        let out = decoder
            .forward(
                &input_ids,
                &context,
                None,
                None,
                0,
                &DecoderOptions::default(),
            )
            .unwrap();
        assert_eq!(out.logits.dims(), &[2, 6, 100]);
    }

    #[test]
    fn decoder_collects_cross_attentions() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut decoder = TransformerDecoder::new(&tiny_config(), vb).unwrap();

        let input_ids = Tensor::zeros((1, 4), DType::U32, &device).unwrap();
        let context = Tensor::randn(0f32, 1.0, (1, 8, 32), &device).unwrap();
        let options = DecoderOptions {
            output_hidden_states: true,
            output_attentions: true,
        };
        let out = decoder
            .forward(&input_ids, &context, None, None, 0, &options)
            .unwrap();
        assert_eq!(out.hidden_states.unwrap().len(), 3);
        let cross = out.cross_attentions.unwrap();
        assert_eq!(cross.len(), 2);
        // Queries over 4 decoder positions, keys over 8 context positions.
        assert_eq!(cross[0].dims(), &[1, 2, 4, 8]);
    }

    #[test]
    fn incremental_decoding_matches_cache_growth() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut decoder = TransformerDecoder::new(&tiny_config(), vb).unwrap();

        let context = Tensor::randn(0f32, 1.0, (1, 8, 32), &device).unwrap();
        let options = DecoderOptions {
            output_attentions: true,
            ..DecoderOptions::default()
        };

        let step0 = Tensor::zeros((1, 1), DType::U32, &device).unwrap();
        let out = decoder
            .forward(&step0, &context, None, None, 0, &options)
            .unwrap();
        assert_eq!(out.attentions.as_ref().unwrap()[0].dims(), &[1, 2, 1, 1]);

        // Second step: self-attention covers two positions.
        let step1 = Tensor::zeros((1, 1), DType::U32, &device).unwrap();
        let out = decoder
            .forward(&step1, &context, None, None, 1, &options)
            .unwrap();
        assert_eq!(out.attentions.as_ref().unwrap()[0].dims(), &[1, 2, 1, 2]);
        assert_eq!(out.logits.dims(), &[1, 1, 100]);

        decoder.clear_kv_cache();
        let out = decoder
            .forward(&step0, &context, None, None, 0, &options)
            .unwrap();
        assert_eq!(out.attentions.as_ref().unwrap()[0].dims(), &[1, 2, 1, 1]);
    }
}
