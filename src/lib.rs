//! Archetypal bottleneck sequence-to-sequence modeling in pure Rust.
//!
//! A candle-based implementation of the hatespace archetypal model: a
//! pretrained encoder-decoder transformer with a compact, interpretable
//! bottleneck spliced between the two halves. Loads safetensors checkpoints
//! directly.
//!
//! ## Architecture
//!
//! ```text
//! token ids → pretrained encoder ─→ hidden states [B, T, H]
//!                                         ↓ flatten
//!                              archetypal bottleneck
//!                              (simplex embedding [B, K])
//!                                         ↓ reconstruct
//!                        reconstructed states [B, T, H]
//!                                         ↓ cross-attention
//!            pretrained decoder ─→ logits / generated text
//! ```
//!
//! The decoder only ever sees the bottleneck's reconstruction, so every
//! generated token is explained by a mixture over `K` archetypes. Generation
//! can start from token ids or directly from a point on the archetype
//! simplex.
//!
//! ## Modules
//!
//! - [`config`] — merged transformer configuration, bottleneck geometry
//! - [`model`] — encoder, decoder, bottleneck embedders, the composed
//!   [`model::archetypal::TransformerArchetypal`], and generation

pub mod config;
pub mod model;

mod error;

pub use error::{Error, Result};
