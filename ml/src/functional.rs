//! Functional construction of the denoising autoencoder: encoder and decoder are
//! built as independent [`Sequential`] sub-models and wired together afterwards.
//!
//! Parameter names match [`crate::denoise::Denoise`], so both constructions can
//! load each other's weight files.
use log::info;

use crate::{
    activation_functions::Activation,
    batch_normalization::BatchNormalizationLayer,
    convolutions::{ConvolutionLayer, Padding},
    denoise::{
        decoder_layer_names, encoder_layer_names, output_layer_name, DenoiseConfig, KERNEL_SIZE,
        STRIDE,
    },
    model_errors::ModelResult,
    models::{Autoencoder, Sequential, Shape},
    transposed_convolutions::TransposedConvolutionLayer,
    weight_loader::WeightLoader,
};

/// Strided convolution + batch normalization for every filter, in order.
pub fn build_encoder<L: WeightLoader>(
    config: &DenoiseConfig,
    loader: &mut L,
) -> ModelResult<Sequential> {
    config.validate()?;
    let mut encoder = Sequential::new("encoder", config.input_shape());
    for (i, &filters) in config.filters.iter().enumerate() {
        let (conv_name, norm_name) = encoder_layer_names(i);
        let channels = encoder.output_shape().channels;
        encoder.add(ConvolutionLayer::from_loader(
            loader,
            &conv_name,
            channels,
            filters,
            KERNEL_SIZE,
            STRIDE,
            Padding::Same,
            Activation::Relu,
        )?)?;
        encoder.add(BatchNormalizationLayer::from_loader(
            loader, &norm_name, filters,
        )?)?;
    }
    Ok(encoder)
}

/// Transposed convolution + batch normalization for every filter in reverse order,
/// then a stride 1 transposed convolution back to the image depth.
pub fn build_decoder<L: WeightLoader>(
    config: &DenoiseConfig,
    latent_shape: Shape,
    loader: &mut L,
) -> ModelResult<Sequential> {
    config.validate()?;
    let mut decoder = Sequential::new("decoder", latent_shape);
    for (i, &filters) in config.filters.iter().rev().enumerate() {
        let (deconv_name, norm_name) = decoder_layer_names(i);
        let channels = decoder.output_shape().channels;
        decoder.add(TransposedConvolutionLayer::from_loader(
            loader,
            &deconv_name,
            channels,
            filters,
            KERNEL_SIZE,
            STRIDE,
            Padding::Same,
            Activation::Relu,
        )?)?;
        decoder.add(BatchNormalizationLayer::from_loader(
            loader, &norm_name, filters,
        )?)?;
    }
    let channels = decoder.output_shape().channels;
    decoder.add(TransposedConvolutionLayer::from_loader(
        loader,
        &output_layer_name(config.filters.len()),
        channels,
        config.depth,
        KERNEL_SIZE,
        1,
        Padding::Same,
        Activation::Sigmoid,
    )?)?;
    Ok(decoder)
}

/// Builds encoder and decoder and feeds the encoder output into the decoder.
pub fn build_autoencoder<L: WeightLoader>(
    config: &DenoiseConfig,
    loader: &mut L,
) -> ModelResult<Autoencoder> {
    let encoder = build_encoder(config, loader)?;
    let decoder = build_decoder(config, encoder.output_shape(), loader)?;
    info!(
        "Wired encoder {} into decoder {}",
        encoder.input_shape(),
        decoder.output_shape()
    );
    Autoencoder::compose(encoder, decoder)
}
