//! Convolutional autoencoder for image denoising, built as a single object
//! that owns its encoder and decoder stages.
//!
//! The encoder halves the spatial size once per entry of the filter list
//! (3x3 convolution, stride 2, relu, batch normalization), the decoder walks the
//! filter list backwards with transposed convolutions and finishes with a
//! stride 1 transposed convolution back to the image depth (sigmoid).
//! See [`crate::functional`] for the same network assembled from sub-models.
use std::{fs, path::Path};

use log::{debug, info};
use ndarray::Axis;
use serde_derive::{Deserialize, Serialize};

use crate::{
    activation_functions::Activation,
    batch_normalization::BatchNormalizationLayer,
    convolutions::{ConvolutionLayer, Padding},
    model_errors::{ModelError, ModelResult},
    models::{summary_table, Layer, Mode, NamedParameter, Shape},
    transposed_convolutions::TransposedConvolutionLayer,
    weight_loader::{save_weights, NpzWeightLoader, WeightLoader},
    Batch, InternalDataRepresentation,
};

pub const KERNEL_SIZE: usize = 3;
pub const STRIDE: usize = 2;

/// File names inside a model directory
pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "weights.npz";

fn default_filters() -> Vec<usize> {
    vec![128, 64]
}

/// Hyperparameters of the autoencoder. `depth` is the number of image channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenoiseConfig {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    #[serde(default = "default_filters")]
    pub filters: Vec<usize>,
}

impl DenoiseConfig {
    pub fn new(width: usize, height: usize, depth: usize) -> DenoiseConfig {
        DenoiseConfig {
            width,
            height,
            depth,
            filters: default_filters(),
        }
    }

    pub fn with_filters(mut self, filters: Vec<usize>) -> DenoiseConfig {
        self.filters = filters;
        self
    }

    pub fn validate(&self) -> ModelResult<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "width, height and depth must be positive, got {}x{}x{}",
                self.width, self.height, self.depth
            )));
        }
        if let Some(i) = self.filters.iter().position(|&f| f == 0) {
            return Err(ModelError::InvalidConfig(format!(
                "filter {} of {:?} is zero",
                i, self.filters
            )));
        }
        Ok(())
    }

    pub fn input_shape(&self) -> Shape {
        Shape::new(self.depth, self.height, self.width)
    }

    /// Every encoder stage maps n to ceil(n / 2), every decoder stage doubles,
    /// so the reconstruction is only as large as the input if both sides are
    /// divisible by 2^(number of filters).
    pub fn output_shape(&self) -> Shape {
        let round_trip = |mut n: usize| {
            for _ in &self.filters {
                n = (n + STRIDE - 1) / STRIDE;
            }
            n * STRIDE.pow(self.filters.len() as u32)
        };
        Shape::new(self.depth, round_trip(self.height), round_trip(self.width))
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> ModelResult<DenoiseConfig> {
        let raw = fs::read_to_string(path)?;
        let config: DenoiseConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> ModelResult<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Names of the convolution and normalization layers of encoder stage `i`.
pub(crate) fn encoder_layer_names(i: usize) -> (String, String) {
    (
        format!("encoder/conv2d_{}", i),
        format!("encoder/batch_normalization_{}", i),
    )
}

/// Names of the transposed convolution and normalization layers of decoder stage `i`.
pub(crate) fn decoder_layer_names(i: usize) -> (String, String) {
    (
        format!("decoder/conv2d_transpose_{}", i),
        format!("decoder/batch_normalization_{}", i),
    )
}

/// The final layer comes after all `num_stages` decoder stages.
pub(crate) fn output_layer_name(num_stages: usize) -> String {
    format!("decoder/conv2d_transpose_{}", num_stages)
}

struct EncoderStage {
    convolution: ConvolutionLayer,
    normalization: BatchNormalizationLayer,
}

struct DecoderStage {
    deconvolution: TransposedConvolutionLayer,
    normalization: BatchNormalizationLayer,
}

/// Denoising autoencoder.
pub struct Denoise {
    config: DenoiseConfig,
    encoder: Vec<EncoderStage>,
    decoder: Vec<DecoderStage>,
    /// Recovers the original depth of the image
    output_layer: TransposedConvolutionLayer,
}

impl Denoise {
    pub fn new<L: WeightLoader>(config: DenoiseConfig, loader: &mut L) -> ModelResult<Denoise> {
        config.validate()?;

        let mut channels = config.depth;
        let mut encoder = Vec::with_capacity(config.filters.len());
        for (i, &filters) in config.filters.iter().enumerate() {
            let (conv_name, norm_name) = encoder_layer_names(i);
            encoder.push(EncoderStage {
                convolution: ConvolutionLayer::from_loader(
                    loader,
                    &conv_name,
                    channels,
                    filters,
                    KERNEL_SIZE,
                    STRIDE,
                    Padding::Same,
                    Activation::Relu,
                )?,
                normalization: BatchNormalizationLayer::from_loader(loader, &norm_name, filters)?,
            });
            channels = filters;
        }

        let mut decoder = Vec::with_capacity(config.filters.len());
        for (i, &filters) in config.filters.iter().rev().enumerate() {
            let (deconv_name, norm_name) = decoder_layer_names(i);
            decoder.push(DecoderStage {
                deconvolution: TransposedConvolutionLayer::from_loader(
                    loader,
                    &deconv_name,
                    channels,
                    filters,
                    KERNEL_SIZE,
                    STRIDE,
                    Padding::Same,
                    Activation::Relu,
                )?,
                normalization: BatchNormalizationLayer::from_loader(loader, &norm_name, filters)?,
            });
            channels = filters;
        }

        let output_layer = TransposedConvolutionLayer::from_loader(
            loader,
            &output_layer_name(config.filters.len()),
            channels,
            config.depth,
            KERNEL_SIZE,
            1,
            Padding::Same,
            Activation::Sigmoid,
        )?;

        info!(
            "Built denoising autoencoder for {}x{}x{} images with filters {:?}",
            config.height, config.width, config.depth, config.filters
        );
        Ok(Denoise {
            config,
            encoder,
            decoder,
            output_layer,
        })
    }

    /// Loads `config.json` and `weights.npz` from a model directory.
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> ModelResult<Denoise> {
        let dir = dir.as_ref();
        let config = DenoiseConfig::from_path(dir.join(CONFIG_FILE))?;
        let mut loader = NpzWeightLoader::from_path(dir.join(WEIGHTS_FILE))?;
        Denoise::new(config, &mut loader)
    }

    /// Writes `config.json` and `weights.npz` into a model directory, creating it if needed.
    pub fn save_to_directory<P: AsRef<Path>>(&self, dir: P) -> ModelResult<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        self.config.save(dir.join(CONFIG_FILE))?;
        save_weights(dir.join(WEIGHTS_FILE), &self.parameters())?;
        info!("Saved model to {}", dir.display());
        Ok(())
    }

    pub fn config(&self) -> &DenoiseConfig {
        &self.config
    }

    fn encoder_layers(&self) -> Vec<&dyn Layer> {
        let mut layers: Vec<&dyn Layer> = Vec::new();
        for stage in &self.encoder {
            layers.push(&stage.convolution);
            layers.push(&stage.normalization);
        }
        layers
    }

    fn decoder_layers(&self) -> Vec<&dyn Layer> {
        let mut layers: Vec<&dyn Layer> = Vec::new();
        for stage in &self.decoder {
            layers.push(&stage.deconvolution);
            layers.push(&stage.normalization);
        }
        layers.push(&self.output_layer);
        layers
    }

    pub fn input_shape(&self) -> Shape {
        self.config.input_shape()
    }

    pub fn latent_shape(&self) -> ModelResult<Shape> {
        self.encoder_layers()
            .iter()
            .try_fold(self.input_shape(), |shape, layer| layer.output_shape(shape))
    }

    pub fn output_shape(&self) -> ModelResult<Shape> {
        self.decoder_layers()
            .iter()
            .try_fold(self.latent_shape()?, |shape, layer| layer.output_shape(shape))
    }

    fn check_shape(part: &str, expected: Shape, input: &Batch) -> ModelResult<()> {
        let found = Shape::of_batch(input);
        if found != expected {
            return Err(ModelError::ShapeMismatch {
                layer: part.to_string(),
                expected,
                found,
            });
        }
        Ok(())
    }

    pub fn encode(&self, inputs: &Batch, mode: Mode) -> ModelResult<Batch> {
        Denoise::check_shape("encoder", self.input_shape(), inputs)?;
        let mut x = inputs.clone();
        for stage in &self.encoder {
            x = stage.convolution.forward(&x, mode)?;
            x = stage.normalization.forward(&x, mode)?;
        }
        Ok(x)
    }

    pub fn decode(&self, latent: &Batch, mode: Mode) -> ModelResult<Batch> {
        Denoise::check_shape("decoder", self.latent_shape()?, latent)?;
        let mut x = latent.clone();
        for stage in &self.decoder {
            x = stage.deconvolution.forward(&x, mode)?;
            x = stage.normalization.forward(&x, mode)?;
        }
        self.output_layer.forward(&x, mode)
    }

    /// Encodes, then decodes the batch.
    pub fn call(&self, inputs: &Batch, mode: Mode) -> ModelResult<Batch> {
        let encoded = self.encode(inputs, mode)?;
        debug!("Latent representation has shape {:?}", encoded.shape());
        self.decode(&encoded, mode)
    }

    /// Denoises a single (channels, height, width) image in inference mode.
    pub fn denoise_image(
        &self,
        image: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation> {
        let batch = image.clone().insert_axis(Axis(0));
        let output = self.call(&batch, Mode::Inference)?;
        Ok(output.index_axis_move(Axis(0), 0))
    }

    /// Runs the batch in training mode and moves the batch normalization
    /// statistics towards the statistics of this batch.
    pub fn calibrate(&mut self, inputs: &Batch) -> ModelResult<Batch> {
        Denoise::check_shape("encoder", self.input_shape(), inputs)?;
        let mut x = inputs.clone();
        for stage in self.encoder.iter_mut() {
            x = stage.convolution.calibrate(&x)?;
            x = stage.normalization.calibrate(&x)?;
        }
        for stage in self.decoder.iter_mut() {
            x = stage.deconvolution.calibrate(&x)?;
            x = stage.normalization.calibrate(&x)?;
        }
        self.output_layer.calibrate(&x)
    }

    pub fn num_parameters(&self) -> usize {
        self.encoder_layers()
            .iter()
            .chain(self.decoder_layers().iter())
            .map(|l| l.num_parameters())
            .sum()
    }

    pub fn parameters(&self) -> Vec<NamedParameter<'_>> {
        let mut params = Vec::new();
        for stage in &self.encoder {
            params.extend(stage.convolution.parameters());
            params.extend(stage.normalization.parameters());
        }
        for stage in &self.decoder {
            params.extend(stage.deconvolution.parameters());
            params.extend(stage.normalization.parameters());
        }
        params.extend(self.output_layer.parameters());
        params
    }

    pub fn summary(&self) -> ModelResult<String> {
        Ok(format!(
            "{}\n{}",
            summary_table("encoder", self.input_shape(), &self.encoder_layers()),
            summary_table("decoder", self.latent_shape()?, &self.decoder_layers())
        ))
    }
}
