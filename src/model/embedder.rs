//! Archetypal bottleneck embedders.
//!
//! An [`Embedder`] maps a tensor onto a compact, interpretable embedding and
//! back: `encode` projects the flattened input onto a probability simplex
//! over a fixed number of archetypes, `decode` reconstructs the flattened
//! input from a point on that simplex. The provided `transform` runs the full
//! round trip and restores the caller's shape, so the composed model can
//! splice any embedder between its encoder and decoder halves.

use candle_core::Tensor;
use candle_nn::{Linear, VarBuilder};

use crate::config::BottleneckConfig;
use crate::Result;

/// A differentiable bottleneck with an encoder and a decoder direction.
///
/// Invariant: the encoder's output width equals the decoder's input width
/// (`num_archetypes`), and every embedding row is a probability distribution
/// over the archetypes.
pub trait Embedder {
    /// Project flattened inputs `[B, input_dimensions]` onto the archetype
    /// simplex `[B, num_archetypes]`.
    fn encode(&self, inputs: &Tensor) -> Result<Tensor>;

    /// Reconstruct flattened inputs `[B, input_dimensions]` from embeddings
    /// `[B, num_archetypes]`.
    fn decode(&self, embedding: &Tensor) -> Result<Tensor>;

    /// Width of the embedding.
    fn num_archetypes(&self) -> usize;

    /// Flattened input width.
    fn input_dimensions(&self) -> usize;

    /// Full round trip: flatten the non-batch dimensions, encode, decode and
    /// restore the input shape. Returns `(reconstruction, embedding)`.
    fn transform(&self, inputs: &Tensor) -> Result<(Tensor, Tensor)> {
        let input_shape = inputs.shape().clone();
        let flat = inputs.flatten_from(1)?;
        let embedding = self.encode(&flat)?;
        let reconstruction = self.decode(&embedding)?.reshape(input_shape)?;
        Ok((reconstruction, embedding))
    }
}

/// Feed-forward archetypal bottleneck.
///
/// Encoder stage: linear → ReLU → linear → softmax over the archetype axis.
/// Decoder stage: linear → ReLU → linear → ReLU, so reconstructions are
/// non-negative. The round trip is lossy by construction — everything the
/// decoder sees has passed through `num_archetypes` degrees of freedom.
pub struct LinearArchetypal {
    encoder_in: Linear,
    encoder_out: Linear,
    decoder_in: Linear,
    decoder_out: Linear,
    input_dimensions: usize,
    num_archetypes: usize,
}

impl LinearArchetypal {
    /// Weight layout mirrors two sequential stacks: `encoder.{0,2}` and
    /// `decoder.{0,2}`.
    pub fn new(config: &BottleneckConfig, vb: VarBuilder) -> Result<Self> {
        let encoder_in = candle_nn::linear(
            config.input_dimensions,
            config.hidden_dimensions,
            vb.pp("encoder.0"),
        )?;
        let encoder_out = candle_nn::linear(
            config.hidden_dimensions,
            config.num_archetypes,
            vb.pp("encoder.2"),
        )?;
        let decoder_in = candle_nn::linear(
            config.num_archetypes,
            config.hidden_dimensions,
            vb.pp("decoder.0"),
        )?;
        let decoder_out = candle_nn::linear(
            config.hidden_dimensions,
            config.input_dimensions,
            vb.pp("decoder.2"),
        )?;
        Ok(Self {
            encoder_in,
            encoder_out,
            decoder_in,
            decoder_out,
            input_dimensions: config.input_dimensions,
            num_archetypes: config.num_archetypes,
        })
    }
}

impl Embedder for LinearArchetypal {
    fn encode(&self, inputs: &Tensor) -> Result<Tensor> {
        let logits = inputs
            .apply(&self.encoder_in)?
            .relu()?
            .apply(&self.encoder_out)?;
        candle_nn::ops::softmax_last_dim(&logits).map_err(Into::into)
    }

    fn decode(&self, embedding: &Tensor) -> Result<Tensor> {
        embedding
            .apply(&self.decoder_in)?
            .relu()?
            .apply(&self.decoder_out)?
            .relu()
            .map_err(Into::into)
    }

    fn num_archetypes(&self) -> usize {
        self.num_archetypes
    }

    fn input_dimensions(&self) -> usize {
        self.input_dimensions
    }
}
