use std::fmt::{self, Display};

use log::debug;
use ndarray::{ArrayViewD, Axis};
use serde_derive::{Deserialize, Serialize};

use crate::{
    model_errors::{ModelError, ModelResult},
    Batch, InternalDataRepresentation, WeightPrecision,
};

/// Whether a forward pass normalizes with batch statistics (training) or with
/// the stored moving statistics (inference).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Inference,
    Training,
}

/// Shape of a single sample, in (channels, height, width) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Per-sample shape of a batch
    pub fn of_batch(batch: &Batch) -> Self {
        let (_, channels, height, width) = batch.dim();
        Self::new(channels, height, width)
    }
}

/// Printed the way the python frameworks show it: batch first, channels last.
impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!(
            "(None, {}, {}, {})",
            self.height, self.width, self.channels
        ))
    }
}

/// A named parameter of a layer, borrowed for persistence.
pub type NamedParameter<'a> = (String, ArrayViewD<'a, WeightPrecision>);

/// General layer trait. Layers are built for a fixed number of input channels,
/// the spatial size is only known at call time.
pub trait Layer {
    fn name(&self) -> &str;

    /// Returns the per-sample output shape for the given input shape,
    /// or an error if the layer cannot process such an input.
    fn output_shape(&self, input: Shape) -> ModelResult<Shape>;

    fn forward(&self, input: &Batch, mode: Mode) -> ModelResult<Batch>;

    fn num_parameters(&self) -> usize;

    fn parameters(&self) -> Vec<NamedParameter<'_>>;

    /// Training-mode forward pass that may update running statistics.
    fn calibrate(&mut self, input: &Batch) -> ModelResult<Batch> {
        self.forward(input, Mode::Training)
    }
}

/// Plain stack of layers with a declared input shape.
pub struct Sequential {
    name: String,
    input_shape: Shape,
    output_shape: Shape,
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(name: &str, input_shape: Shape) -> Sequential {
        Sequential {
            name: name.to_string(),
            input_shape,
            output_shape: input_shape,
            layers: Vec::new(),
        }
    }

    /// Appends a layer. Fails if the layer does not accept the current output shape.
    pub fn add<L: Layer + 'static>(&mut self, layer: L) -> ModelResult<()> {
        self.output_shape = layer.output_shape(self.output_shape)?;
        debug!(
            "{}: added {} with output shape {}",
            self.name,
            layer.name(),
            self.output_shape
        );
        self.layers.push(Box::new(layer));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    pub fn output_shape(&self) -> Shape {
        self.output_shape
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.num_parameters()).sum()
    }

    pub fn parameters(&self) -> Vec<NamedParameter<'_>> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn check_input(&self, input: &Batch) -> ModelResult<()> {
        let found = Shape::of_batch(input);
        if found != self.input_shape {
            return Err(ModelError::ShapeMismatch {
                layer: self.name.clone(),
                expected: self.input_shape,
                found,
            });
        }
        Ok(())
    }

    pub fn forward(&self, input: &Batch, mode: Mode) -> ModelResult<Batch> {
        self.check_input(input)?;
        let mut x = input.clone();
        for layer in &self.layers {
            x = layer.forward(&x, mode)?;
        }
        Ok(x)
    }

    pub fn calibrate(&mut self, input: &Batch) -> ModelResult<Batch> {
        self.check_input(input)?;
        let mut x = input.clone();
        for layer in self.layers.iter_mut() {
            x = layer.calibrate(&x)?;
        }
        Ok(x)
    }

    /// Layer table with output shapes and parameter counts.
    pub fn summary(&self) -> String {
        let layers: Vec<&dyn Layer> = self.layers.iter().map(|l| &**l).collect();
        summary_table(&self.name, self.input_shape, &layers)
    }
}

/// Formats a layer table the way keras' `Model.summary` does.
pub fn summary_table(name: &str, input_shape: Shape, layers: &[&dyn Layer]) -> String {
    let mut out = format!("Model: \"{}\"\n", name);
    out += &format!("{:<40}{:<26}{:>10}\n", "Layer", "Output Shape", "Param #");
    out += &format!("{:<40}{:<26}{:>10}\n", "input", input_shape, 0);
    let mut shape = input_shape;
    let mut total = 0;
    for layer in layers {
        // shapes were validated when the model was built
        shape = layer.output_shape(shape).unwrap_or(shape);
        total += layer.num_parameters();
        out += &format!(
            "{:<40}{:<26}{:>10}\n",
            layer.name(),
            shape,
            layer.num_parameters()
        );
    }
    out += &format!("Total params: {}\n", total);
    out
}

/// Composition of an encoder and a decoder sub-model.
pub struct Autoencoder {
    encoder: Sequential,
    decoder: Sequential,
}

impl Autoencoder {
    /// Wires the encoder output into the decoder input.
    pub fn compose(encoder: Sequential, decoder: Sequential) -> ModelResult<Autoencoder> {
        if encoder.output_shape() != decoder.input_shape() {
            return Err(ModelError::CompositionMismatch {
                encoder_output: encoder.output_shape(),
                decoder_input: decoder.input_shape(),
            });
        }
        Ok(Autoencoder { encoder, decoder })
    }

    pub fn encoder(&self) -> &Sequential {
        &self.encoder
    }

    pub fn decoder(&self) -> &Sequential {
        &self.decoder
    }

    pub fn input_shape(&self) -> Shape {
        self.encoder.input_shape()
    }

    pub fn latent_shape(&self) -> Shape {
        self.encoder.output_shape()
    }

    pub fn output_shape(&self) -> Shape {
        self.decoder.output_shape()
    }

    pub fn encode(&self, input: &Batch, mode: Mode) -> ModelResult<Batch> {
        self.encoder.forward(input, mode)
    }

    pub fn decode(&self, latent: &Batch, mode: Mode) -> ModelResult<Batch> {
        self.decoder.forward(latent, mode)
    }

    pub fn forward(&self, input: &Batch, mode: Mode) -> ModelResult<Batch> {
        let encoded = self.encode(input, mode)?;
        self.decode(&encoded, mode)
    }

    /// Runs a single image through the autoencoder in inference mode.
    pub fn forward_pass(
        &self,
        image: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation> {
        let batch = image.clone().insert_axis(Axis(0));
        let out = self.forward(&batch, Mode::Inference)?;
        Ok(out.index_axis_move(Axis(0), 0))
    }

    pub fn calibrate(&mut self, input: &Batch) -> ModelResult<Batch> {
        let encoded = self.encoder.calibrate(input)?;
        self.decoder.calibrate(&encoded)
    }

    pub fn num_parameters(&self) -> usize {
        self.encoder.num_parameters() + self.decoder.num_parameters()
    }

    pub fn parameters(&self) -> Vec<NamedParameter<'_>> {
        let mut params = self.encoder.parameters();
        params.extend(self.decoder.parameters());
        params
    }

    pub fn summary(&self) -> String {
        format!("{}\n{}", self.encoder.summary(), self.decoder.summary())
    }
}
