//! Model configuration.
//!
//! [`TransformerConfig`] is the merged configuration shared by the pretrained
//! encoder and decoder halves; defaults match a RoBERTa-base-sized checkpoint
//! and unspecified fields fall back to those defaults when deserializing a
//! checkpoint's `config.json`.
//!
//! [`BottleneckConfig`] sizes the archetypal bottleneck that sits between the
//! two halves.

use serde::Deserialize;

/// Merged configuration for the pretrained encoder/decoder pair.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformerConfig {
    /// Vocabulary size (also the width of the decoder's logit output).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Hidden dimension of both transformer halves.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Number of layers per half.
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    /// Number of attention heads.
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    /// Feed-forward inner width.
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    /// Maximum sequence length for learned position embeddings.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// LayerNorm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Padding token id. Required for deriving decoder inputs.
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: Option<u32>,

    /// Token the decoder starts generating from. Required for deriving
    /// decoder inputs and for generation.
    #[serde(default = "default_decoder_start_token_id")]
    pub decoder_start_token_id: Option<u32>,

    /// End-of-sequence token id. Generation stops when every row emitted it.
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: Option<u32>,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            intermediate_size: default_intermediate_size(),
            max_position_embeddings: default_max_position_embeddings(),
            layer_norm_eps: default_layer_norm_eps(),
            pad_token_id: default_pad_token_id(),
            decoder_start_token_id: default_decoder_start_token_id(),
            eos_token_id: default_eos_token_id(),
        }
    }
}

impl TransformerConfig {
    /// Dimension per attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

fn default_vocab_size() -> usize {
    50265
}
fn default_hidden_size() -> usize {
    768
}
fn default_num_hidden_layers() -> usize {
    12
}
fn default_num_attention_heads() -> usize {
    12
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_max_position_embeddings() -> usize {
    512
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_pad_token_id() -> Option<u32> {
    Some(1)
}
fn default_decoder_start_token_id() -> Option<u32> {
    Some(0)
}
fn default_eos_token_id() -> Option<u32> {
    Some(2)
}

/// Configuration for the archetypal bottleneck.
///
/// The bottleneck consumes the encoder's hidden-state sequence flattened to a
/// single vector per instance, so `input_dimensions` must equal
/// `sequence length × hidden size` of the transformer halves.
#[derive(Debug, Clone, Deserialize)]
pub struct BottleneckConfig {
    /// Flattened input width (sequence length × hidden size).
    pub input_dimensions: usize,

    /// Number of archetypes — the width of the simplex embedding.
    pub num_archetypes: usize,

    /// Feed-forward width of the bottleneck's encoder/decoder stacks.
    #[serde(default = "default_bottleneck_hidden")]
    pub hidden_dimensions: usize,
}

impl BottleneckConfig {
    pub fn new(input_dimensions: usize, num_archetypes: usize) -> Self {
        Self {
            input_dimensions,
            num_archetypes,
            hidden_dimensions: default_bottleneck_hidden(),
        }
    }

    /// Sequence length of the hidden-state geometry this bottleneck
    /// reconstructs, derived from the transformer hidden size.
    ///
    /// Returns `None` when `input_dimensions` is not a multiple of
    /// `hidden_size` — such a bottleneck cannot be reshaped into the
    /// decoder's cross-attention geometry.
    pub fn sequence_length(&self, hidden_size: usize) -> Option<usize> {
        if hidden_size == 0 || self.input_dimensions % hidden_size != 0 {
            None
        } else {
            Some(self.input_dimensions / hidden_size)
        }
    }
}

fn default_bottleneck_hidden() -> usize {
    128
}
