//! Forward-pass building blocks for convolutional autoencoders.
//!
//! Layers operate on batches in Pytorch layout `(N, C, H, W)`. The denoising
//! autoencoder itself lives in [`denoise`] (object style) and
//! [`functional`] (functional style).
pub mod activation_functions;
pub mod batch_normalization;
pub mod convolutions;
pub mod denoise;
pub mod functional;
pub mod model_errors;
pub mod models;
pub mod transposed_convolutions;
pub mod weight_loader;

use ndarray::{Array3, Array4};

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;

/// Kernel of a (transposed) convolution, 4 dimensional.
pub type ConvKernel = ndarray::Array4<WeightPrecision>;

/// A single image in (channels, height, width) layout.
pub type InternalDataRepresentation = Array3<ImagePrecision>;

/// A batch of images in (batch, channels, height, width) layout.
pub type Batch = Array4<ImagePrecision>;
