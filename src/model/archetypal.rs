//! The composed generative model.
//!
//! [`TransformerArchetypal`] wires a pretrained encoder, an archetypal
//! bottleneck and a pretrained decoder into one differentiable model:
//!
//! ```text
//! input ids → encoder → [B, T, H] ──flatten──→ bottleneck ──→ embedding [B, K]
//!                                                  │
//!                                        reconstruction [B, T, H]
//!                                                  ↓
//! decoder ids ─────────────────→ decoder (cross-attention) → logits
//! ```
//!
//! The decoder never sees the true encoder states — its cross-attention
//! context is always the bottleneck's reconstruction, so the whole generative
//! signal passes through the interpretable embedding.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::sync::Api;

use super::decoder::{DecoderOptions, TransformerDecoder};
use super::embedder::Embedder;
use super::encoder::{EncoderOptions, EncoderOutput, TransformerEncoder};
use crate::config::TransformerConfig;
use crate::{Error, Result};

/// Sentinel marking ignored positions in `I64` label tensors.
pub const IGNORE_INDEX: i64 = -100;

/// Inputs for a [`TransformerArchetypal::forward`] pass.
///
/// Encoder-bound and decoder-bound knobs are separate structs rather than a
/// prefixed option bag, so nothing is routed by name at runtime.
#[derive(Default)]
pub struct ForwardInputs {
    /// Token ids `[B, T]` for the encoder.
    pub input_ids: Option<Tensor>,
    /// Padding mask `[B, T]` for the encoder; also masks cross-attention.
    pub attention_mask: Option<Tensor>,
    /// Precomputed token embeddings `[B, T, H]`, bypassing the lookup.
    pub inputs_embeds: Option<Tensor>,
    /// Decoder token ids `[B, T_dec]`; derived by shifting when absent.
    pub decoder_input_ids: Option<Tensor>,
    /// Padding mask `[B, T_dec]` for the decoder.
    pub decoder_attention_mask: Option<Tensor>,
    /// Precomputed encoder output; the encoder is skipped when present.
    pub encoder_outputs: Option<EncoderOutput>,
    /// Target ids `[B, T_dec]`, `I64` with [`IGNORE_INDEX`] sentinels.
    /// Used only to derive decoder inputs when those are absent.
    pub labels: Option<Tensor>,
    /// Encoder diagnostics.
    pub encoder_options: EncoderOptions,
    /// Decoder diagnostics.
    pub decoder_options: DecoderOptions,
}

/// Structured result of a forward pass.
pub struct ArchetypalOutput {
    /// Decoder vocabulary logits `[B, T_dec, vocab_size]`.
    pub logits: Tensor,
    /// Archetype mixture `[B, num_archetypes]`; rows sum to 1.
    pub embedding: Tensor,
    /// The bottleneck's reconstruction of the encoder states `[B, T, H]` —
    /// the context the decoder actually attended to.
    pub reconstructed_hidden_states: Tensor,
    /// True encoder states `[B, T, H]` (diagnostic; unseen by the decoder).
    pub encoder_last_hidden_state: Tensor,
    /// Encoder hidden states per stage, when requested.
    pub encoder_hidden_states: Option<Vec<Tensor>>,
    /// Encoder attention probabilities per layer, when requested.
    pub encoder_attentions: Option<Vec<Tensor>>,
    /// Decoder hidden states per stage, when requested.
    pub decoder_hidden_states: Option<Vec<Tensor>>,
    /// Decoder self-attention probabilities per layer, when requested.
    pub decoder_attentions: Option<Vec<Tensor>>,
    /// Decoder cross-attention probabilities per layer, when requested.
    pub cross_attentions: Option<Vec<Tensor>>,
}

/// Right-shift token ids by one position for teacher-forced decoding.
///
/// Position 0 becomes `decoder_start_token_id`; position `i > 0` takes the
/// id at `i - 1`. In `I64` label tensors the [`IGNORE_INDEX`] sentinel is
/// replaced with the pad id.
pub fn shift_tokens_right(
    input_ids: &Tensor,
    pad_token_id: u32,
    decoder_start_token_id: u32,
) -> Result<Tensor> {
    let (batch_size, seq_len) = input_ids.dims2()?;
    if seq_len == 0 {
        return Err(Error::Config("cannot shift an empty sequence".into()));
    }
    let start = Tensor::full(decoder_start_token_id, (batch_size, 1), input_ids.device())?
        .to_dtype(input_ids.dtype())?;
    let shifted = Tensor::cat(&[&start, &input_ids.narrow(1, 0, seq_len - 1)?], 1)?;
    if shifted.dtype() != DType::I64 {
        return Ok(shifted);
    }
    let ignore = Tensor::full(IGNORE_INDEX, (batch_size, seq_len), shifted.device())?;
    let pad = Tensor::full(pad_token_id as i64, (batch_size, seq_len), shifted.device())?;
    shifted
        .eq(&ignore)?
        .where_cond(&pad, &shifted)
        .map_err(Into::into)
}

/// Pretrained encoder-decoder pair with an archetypal bottleneck in between.
pub struct TransformerArchetypal {
    pub(crate) encoder: TransformerEncoder,
    pub(crate) decoder: TransformerDecoder,
    pub(crate) inner_embedder: Box<dyn Embedder>,
    pub(crate) config: TransformerConfig,
}

impl TransformerArchetypal {
    /// Build both halves from one merged configuration and a weight source.
    ///
    /// Weight paths: `encoder.*`, `decoder.*`. The bottleneck is built by the
    /// caller (typically from a sibling prefix of the same `VarBuilder`) so
    /// any [`Embedder`] implementation can be spliced in.
    pub fn new(
        config: &TransformerConfig,
        inner_embedder: Box<dyn Embedder>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let encoder = TransformerEncoder::new(config, vb.pp("encoder"))?;
        let decoder = TransformerDecoder::new(config, vb.pp("decoder"))?;
        Ok(Self {
            encoder,
            decoder,
            inner_embedder,
            config: config.clone(),
        })
    }

    /// Load pretrained halves from checkpoint repositories.
    ///
    /// With one id, a single checkpoint provides both halves. With two, the
    /// first provides the encoder and the merged configuration, the second
    /// the decoder; the checkpoints must agree on hidden size and vocabulary.
    pub fn from_pretrained(
        model_id: &str,
        decoder_model_id: Option<&str>,
        inner_embedder: Box<dyn Embedder>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let api = Api::new().map_err(|e| Error::HfHub(e.to_string()))?;
        let repo = api.model(model_id.to_string());
        let config_path = repo
            .get("config.json")
            .map_err(|e| Error::HfHub(e.to_string()))?;
        let config: TransformerConfig =
            serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let weights_path = repo
            .get("model.safetensors")
            .map_err(|e| Error::HfHub(e.to_string()))?;

        tracing::info!("loading encoder weights from {model_id}");
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&weights_path], dtype, device)
                .map_err(|e| Error::WeightLoad(format!("{model_id}: {e}")))?
        };

        let (decoder_config, decoder_vb) = match decoder_model_id {
            Some(id) => {
                let repo = api.model(id.to_string());
                let config_path = repo
                    .get("config.json")
                    .map_err(|e| Error::HfHub(e.to_string()))?;
                let decoder_config: TransformerConfig =
                    serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
                if decoder_config.hidden_size != config.hidden_size
                    || decoder_config.vocab_size != config.vocab_size
                {
                    return Err(Error::Config(format!(
                        "encoder checkpoint {model_id} and decoder checkpoint {id} disagree on geometry"
                    )));
                }
                let weights_path = repo
                    .get("model.safetensors")
                    .map_err(|e| Error::HfHub(e.to_string()))?;
                tracing::info!("loading decoder weights from {id}");
                let decoder_vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[&weights_path], dtype, device)
                        .map_err(|e| Error::WeightLoad(format!("{id}: {e}")))?
                };
                (decoder_config, decoder_vb)
            }
            None => (config.clone(), vb.clone()),
        };

        let encoder = TransformerEncoder::new(&config, vb.pp("encoder"))?;
        let decoder = TransformerDecoder::new(&decoder_config, decoder_vb.pp("decoder"))?;
        tracing::info!(
            vocab_size = decoder.vocab_size(),
            hidden_size = config.hidden_size,
            "model loaded"
        );
        Ok(Self {
            encoder,
            decoder,
            inner_embedder,
            config,
        })
    }

    /// The merged configuration shared by both halves.
    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Width of the decoder's logit output.
    pub fn vocab_size(&self) -> usize {
        self.decoder.vocab_size()
    }

    /// The bottleneck embedder.
    pub fn inner_embedder(&self) -> &dyn Embedder {
        self.inner_embedder.as_ref()
    }

    /// Drop the decoder's cached key/value states.
    pub fn clear_kv_cache(&mut self) {
        self.decoder.clear_kv_cache();
    }

    /// Full teacher-forced pass: encode, bottleneck, decode.
    ///
    /// When `decoder_input_ids` are absent they are derived by right-shifting
    /// `labels` (preferred) or `input_ids`; that derivation requires both
    /// `pad_token_id` and `decoder_start_token_id` and fails with
    /// [`Error::Config`] before any tensor work otherwise.
    pub fn forward(&mut self, inputs: ForwardInputs) -> Result<ArchetypalOutput> {
        let ForwardInputs {
            input_ids,
            attention_mask,
            inputs_embeds,
            decoder_input_ids,
            decoder_attention_mask,
            encoder_outputs,
            labels,
            encoder_options,
            decoder_options,
        } = inputs;

        let decoder_input_ids = match decoder_input_ids {
            Some(ids) => ids,
            None => {
                let pad = self.config.pad_token_id.ok_or_else(|| {
                    Error::Config("pad_token_id must be set to derive decoder inputs".into())
                })?;
                let start = self.config.decoder_start_token_id.ok_or_else(|| {
                    Error::Config(
                        "decoder_start_token_id must be set to derive decoder inputs".into(),
                    )
                })?;
                let source = labels.as_ref().or(input_ids.as_ref()).ok_or_else(|| {
                    Error::Config(
                        "forward needs decoder_input_ids, labels or input_ids".into(),
                    )
                })?;
                shift_tokens_right(source, pad, start)?
            }
        };

        let encoder_outputs = match encoder_outputs {
            Some(outputs) => outputs,
            None => self.encoder.forward(
                input_ids.as_ref(),
                inputs_embeds.as_ref(),
                attention_mask.as_ref(),
                &encoder_options,
            )?,
        };

        let (reconstruction, embedding) = self
            .inner_embedder
            .transform(&encoder_outputs.last_hidden_state)?;

        self.decoder.clear_kv_cache();
        let decoder_outputs = self.decoder.forward(
            &decoder_input_ids,
            &reconstruction,
            attention_mask.as_ref(),
            decoder_attention_mask.as_ref(),
            0,
            &decoder_options,
        )?;

        Ok(ArchetypalOutput {
            logits: decoder_outputs.logits,
            embedding,
            reconstructed_hidden_states: reconstruction,
            encoder_last_hidden_state: encoder_outputs.last_hidden_state,
            encoder_hidden_states: encoder_outputs.hidden_states,
            encoder_attentions: encoder_outputs.attentions,
            decoder_hidden_states: decoder_outputs.hidden_states,
            decoder_attentions: decoder_outputs.attentions,
            cross_attentions: decoder_outputs.cross_attentions,
        })
    }
}
