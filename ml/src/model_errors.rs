use ndarray::ShapeError;
use thiserror::Error;

use crate::{models::Shape, weight_loader::WeightError};

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Layer {layer} expected input of shape {expected}, got {found}.")]
    ShapeMismatch {
        layer: String,
        expected: Shape,
        found: Shape,
    },
    #[error("Layer {layer} expected {expected} input channels, got {found}.")]
    ChannelMismatch {
        layer: String,
        expected: usize,
        found: usize,
    },
    #[error("Layer {layer} cannot process input of spatial size {height}x{width}.")]
    InputTooSmall {
        layer: String,
        height: usize,
        width: usize,
    },
    #[error("Encoder output {encoder_output} does not fit decoder input {decoder_input}.")]
    CompositionMismatch {
        encoder_output: Shape,
        decoder_input: Shape,
    },
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("Could not load weights:\n {0}")]
    Weights(#[from] WeightError),
    #[error("Could not reshape array:\n {0}")]
    Reshape(#[from] ShapeError),
    #[error("Could not read or write model file:\n {0}")]
    Io(#[from] std::io::Error),
    #[error("Model configuration is not valid JSON:\n {0}")]
    ConfigFormat(#[from] serde_json::Error),
}
