//! Autoregressive generation for the composed model.
//!
//! Two entry points:
//! - [`TransformerArchetypal::generate_from_sequence`] — the standard path:
//!   encode the input tokens, pass them through the bottleneck, decode
//!   token by token against the reconstruction.
//! - [`TransformerArchetypal::generate_from_embeddings`] — start from an
//!   arbitrary point on the archetype simplex: only the bottleneck's decoder
//!   stage runs, its output is reshaped into the decoder's cross-attention
//!   geometry, and the encoder is never touched. This is what makes the
//!   embedding space explorable — any mixture of archetypes can be decoded
//!   into text.
//!
//! Every decoding step cross-attends to the bottleneck reconstruction, so
//! generation carries no information that did not pass through the
//! embedding.

use candle_core::{DType, IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;

use super::archetypal::TransformerArchetypal;
use super::decoder::DecoderOptions;
use super::encoder::EncoderOptions;
use crate::{Error, Result};

/// Sampling settings for a generation call.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate per sequence.
    pub max_new_tokens: usize,
    /// Sampling temperature; `None` or 0 means greedy argmax decoding.
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold.
    pub top_p: Option<f64>,
    /// Seed for the sampler.
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 64,
            temperature: None,
            top_p: None,
            seed: 299792458,
        }
    }
}

impl TransformerArchetypal {
    /// Generate token sequences from input token ids `[B, T]`.
    ///
    /// Runs the encoder and the bottleneck once, then decodes
    /// autoregressively against the reconstruction. Returns generated ids
    /// `[B, T_gen]` (without the start token); rows that finish early are
    /// padded.
    pub fn generate_from_sequence(
        &mut self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        config: &GenerationConfig,
    ) -> Result<Tensor> {
        let encoder_outputs = self.encoder.forward(
            Some(input_ids),
            None,
            attention_mask,
            &EncoderOptions::default(),
        )?;
        let (reconstruction, _embedding) = self
            .inner_embedder
            .transform(&encoder_outputs.last_hidden_state)?;
        tracing::debug!(
            context = ?reconstruction.dims(),
            "decoding against bottleneck reconstruction"
        );
        self.decode_tokens(&reconstruction, attention_mask, config)
    }

    /// Generate token sequences from archetype embeddings `[B, K]`.
    ///
    /// Bypasses the encoder and the bottleneck's encode stage entirely: the
    /// supplied embedding is decoded into a flat hidden-state vector, which
    /// is reshaped into `[B, T, H]` (the sequence length is derived from the
    /// bottleneck width and the model's hidden size) and used as a synthetic
    /// cross-attention context.
    pub fn generate_from_embeddings(
        &mut self,
        embeddings: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Tensor> {
        let (batch_size, width) = embeddings.dims2()?;
        let num_archetypes = self.inner_embedder.num_archetypes();
        if width != num_archetypes {
            return Err(Error::Config(format!(
                "embedding width {width} does not match the bottleneck's {num_archetypes} archetypes"
            )));
        }
        let hidden_size = self.config.hidden_size;
        let input_dimensions = self.inner_embedder.input_dimensions();
        if input_dimensions % hidden_size != 0 {
            return Err(Error::Config(format!(
                "bottleneck width {input_dimensions} does not reshape into sequences of hidden size {hidden_size}"
            )));
        }
        let seq_len = input_dimensions / hidden_size;

        let flat = self.inner_embedder.decode(embeddings)?;
        let context = flat.reshape((batch_size, seq_len, hidden_size))?;
        tracing::debug!(
            batch_size,
            seq_len,
            hidden_size,
            "decoding from synthetic context"
        );
        self.decode_tokens(&context, None, config)
    }

    /// Token-by-token decoding against a fixed cross-attention context.
    fn decode_tokens(
        &mut self,
        cross_states: &Tensor,
        cross_mask: Option<&Tensor>,
        config: &GenerationConfig,
    ) -> Result<Tensor> {
        let start = self.config.decoder_start_token_id.ok_or_else(|| {
            Error::Config("decoder_start_token_id must be set for generation".into())
        })?;
        let eos = self.config.eos_token_id;
        let pad = self.config.pad_token_id.unwrap_or(start);
        let batch_size = cross_states.dim(0)?;
        let device = cross_states.device();

        self.decoder.clear_kv_cache();
        let mut logits_processor =
            LogitsProcessor::new(config.seed, config.temperature, config.top_p);

        let mut generated: Vec<Vec<u32>> = vec![Vec::new(); batch_size];
        let mut finished = vec![false; batch_size];
        let mut step_input = Tensor::full(start, (batch_size, 1), device)?;

        for step in 0..config.max_new_tokens {
            let output = self.decoder.forward(
                &step_input,
                cross_states,
                cross_mask,
                None,
                step,
                &DecoderOptions::default(),
            )?;
            let logits = output.logits.squeeze(1)?.to_dtype(DType::F32)?;

            let mut next_column = Vec::with_capacity(batch_size);
            for row in 0..batch_size {
                let next = if finished[row] {
                    pad
                } else {
                    logits_processor.sample(&logits.i(row)?)?
                };
                if Some(next) == eos {
                    finished[row] = true;
                }
                generated[row].push(next);
                next_column.push(next);
            }
            step_input = Tensor::from_vec(next_column, (batch_size, 1), device)?;
            if finished.iter().all(|done| *done) {
                break;
            }
        }

        let generated_len = generated[0].len();
        let flat: Vec<u32> = generated.into_iter().flatten().collect();
        Tensor::from_vec(flat, (batch_size, generated_len), device).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BottleneckConfig, TransformerConfig};
    use crate::model::embedder::LinearArchetypal;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 97,
            hidden_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 64,
            max_position_embeddings: 64,
            ..TransformerConfig::default()
        }
    }

    fn tiny_model(config: &TransformerConfig) -> (VarMap, TransformerArchetypal) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let bottleneck = BottleneckConfig::new(8 * config.hidden_size, 5);
        let embedder = LinearArchetypal::new(&bottleneck, vb.pp("inner_embedder")).unwrap();
        let model = TransformerArchetypal::new(config, Box::new(embedder), vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn generate_from_sequence_produces_tokens() {
        let config = tiny_config();
        let (_varmap, mut model) = tiny_model(&config);
        let device = Device::Cpu;

        let input_ids = Tensor::ones((2, 8), DType::U32, &device).unwrap();
        let generation = GenerationConfig {
            max_new_tokens: 5,
            ..GenerationConfig::default()
        };
        let tokens = model
            .generate_from_sequence(&input_ids, None, &generation)
            .unwrap();
        let dims = tokens.dims();
        assert_eq!(dims[0], 2);
        assert!(dims[1] >= 1 && dims[1] <= 5);
        let rows: Vec<Vec<u32>> = tokens.to_vec2().unwrap();
        for row in rows {
            assert!(row.iter().all(|id| (*id as usize) < 97));
        }
    }

    #[test]
    fn generate_from_embeddings_produces_tokens() {
        let config = tiny_config();
        let (_varmap, mut model) = tiny_model(&config);
        let device = Device::Cpu;

        // A one-hot archetype mixture: pure archetype 2.
        let embeddings = Tensor::new(&[[0f32, 0.0, 1.0, 0.0, 0.0]], &device).unwrap();
        let generation = GenerationConfig {
            max_new_tokens: 4,
            ..GenerationConfig::default()
        };
        let tokens = model
            .generate_from_embeddings(&embeddings, &generation)
            .unwrap();
        assert_eq!(tokens.dims()[0], 1);
        assert!(tokens.dims()[1] >= 1 && tokens.dims()[1] <= 4);
    }

    #[test]
    fn generate_from_embeddings_never_touches_the_encoder() {
        let config = tiny_config();
        let (varmap, mut model) = tiny_model(&config);
        let device = Device::Cpu;

        // Poison every encoder parameter with NaN. If the encoder ran, NaN
        // would reach the logits and sampling would fail or emit garbage.
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.starts_with("encoder.") {
                let nan = Tensor::full(f32::NAN, var.dims(), &device).unwrap();
                var.set(&nan).unwrap();
            }
        }

        let embeddings = Tensor::new(&[[0.2f32, 0.2, 0.2, 0.2, 0.2]], &device).unwrap();
        let generation = GenerationConfig {
            max_new_tokens: 3,
            ..GenerationConfig::default()
        };
        let tokens = model
            .generate_from_embeddings(&embeddings, &generation)
            .unwrap();
        let rows: Vec<Vec<u32>> = tokens.to_vec2().unwrap();
        assert!(rows[0].iter().all(|id| (*id as usize) < 97));
    }

    #[test]
    fn generate_rejects_wrong_embedding_width() {
        let config = tiny_config();
        let (_varmap, mut model) = tiny_model(&config);
        let device = Device::Cpu;

        let embeddings = Tensor::new(&[[0.5f32, 0.5]], &device).unwrap();
        let err = model
            .generate_from_embeddings(&embeddings, &GenerationConfig::default())
            .unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn generation_is_deterministic_under_greedy_decoding() {
        let config = tiny_config();
        let (_varmap, mut model) = tiny_model(&config);
        let device = Device::Cpu;

        let embeddings = Tensor::new(&[[1f32, 0.0, 0.0, 0.0, 0.0]], &device).unwrap();
        let generation = GenerationConfig {
            max_new_tokens: 4,
            ..GenerationConfig::default()
        };
        let first: Vec<Vec<u32>> = model
            .generate_from_embeddings(&embeddings, &generation)
            .unwrap()
            .to_vec2()
            .unwrap();
        let second: Vec<Vec<u32>> = model
            .generate_from_embeddings(&embeddings, &generation)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(first, second);
    }
}
