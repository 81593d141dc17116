//! Transposed convolutions (also wrongly called deconvolution layers)
//! are learnable upsampling maps.
//! More can be read here:
//! - https://datascience.stackexchange.com/questions/6107/what-are-deconvolutional-layers
//! - https://github.com/akutzer/numpy_cnn/blob/master/CNN/Layer/TransposedConv.py
//! - https://ieee.nitk.ac.in/blog/deconv/
use crate::{
    activation_functions::Activation,
    convolutions::Padding,
    model_errors::{ModelError, ModelResult},
    models::{Layer, Mode, NamedParameter, Shape},
    weight_loader::WeightLoader,
    Batch, ConvKernel, ImagePrecision, InternalDataRepresentation, WeightPrecision,
};
use ndarray::*;

/// Geometry of a transposed convolution along one axis: (output length, rows cropped in front).
/// Output lengths follow tensorflow: n * s for Same, n * s + max(k - s, 0) for Valid.
pub(crate) fn transposed_axis_geometry(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Option<(usize, usize)> {
    if input == 0 {
        return None;
    }
    let overhang = kernel.saturating_sub(stride);
    match padding {
        Padding::Same => Some((input * stride, overhang / 2)),
        Padding::Valid => Some((input * stride + overhang, 0)),
    }
}

/// Analog to a Convolution Layer.
/// The weight matrix shall have dimension (in that order)
/// input channels x output channels x kernel height x kernel width.
pub struct TransposedConvolutionLayer {
    name: String,
    kernel: ConvKernel,
    bias: Array1<WeightPrecision>,
    kernel_height: usize,
    kernel_width: usize,
    stride: usize,
    padding: Padding,
    activation: Activation,
    num_input_channels: usize,
    num_output_channels: usize,
}

impl TransposedConvolutionLayer {
    pub fn new(
        name: &str,
        weights: ConvKernel,
        bias: Array1<WeightPrecision>,
        stride: usize,
        padding: Padding,
        activation: Activation,
    ) -> ModelResult<TransposedConvolutionLayer> {
        let (num_input_channels, num_output_channels, kernel_height, kernel_width) = weights.dim();
        if stride == 0 || kernel_height == 0 || kernel_width == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "{}: stride and kernel size must be positive",
                name
            )));
        }
        if bias.len() != num_output_channels {
            return Err(ModelError::InvalidConfig(format!(
                "{}: bias has {} entries for {} filters",
                name,
                bias.len(),
                num_output_channels
            )));
        }
        Ok(TransposedConvolutionLayer {
            name: name.to_string(),
            kernel: weights,
            bias,
            kernel_height,
            kernel_width,
            stride,
            padding,
            activation,
            num_input_channels,
            num_output_channels,
        })
    }

    pub fn from_loader<L: WeightLoader>(
        loader: &mut L,
        name: &str,
        input_channels: usize,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        activation: Activation,
    ) -> ModelResult<TransposedConvolutionLayer> {
        let kernel: ConvKernel = loader.get_weight(
            &format!("{}/kernel", name),
            (input_channels, filters, kernel_size, kernel_size),
        )?;
        let bias: Array1<WeightPrecision> =
            loader.get_weight(&format!("{}/bias", name), filters)?;
        TransposedConvolutionLayer::new(name, kernel, bias, stride, padding, activation)
    }

    /// ((out_h, crop_top), (out_w, crop_left))
    fn geometry(
        &self,
        height: usize,
        width: usize,
    ) -> ModelResult<((usize, usize), (usize, usize))> {
        let vertical =
            transposed_axis_geometry(height, self.kernel_height, self.stride, self.padding);
        let horizontal =
            transposed_axis_geometry(width, self.kernel_width, self.stride, self.padding);
        match (vertical, horizontal) {
            (Some(v), Some(h)) => Ok((v, h)),
            _ => Err(ModelError::InputTooSmall {
                layer: self.name.clone(),
                height,
                width,
            }),
        }
    }

    /// Performs a transposed convolution on the input image. This upsamples the image.
    /// More explanation can be read here:
    /// - https://datascience.stackexchange.com/questions/6107/what-are-deconvolutional-layers
    pub fn transposed_convolve(
        &self,
        image: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation> {
        self.transposed_convolve_view(image.view())
    }

    /// Every input pixel scatters its kernel-weighted value into a window of the
    /// output. For each kernel tap this is one matrix product, added into a strided
    /// view of the full (uncropped) output.
    fn transposed_convolve_view(
        &self,
        image: ArrayView3<ImagePrecision>,
    ) -> ModelResult<Array3<ImagePrecision>> {
        let (channels, height, width) = image.dim();
        if channels != self.num_input_channels {
            return Err(ModelError::ChannelMismatch {
                layer: self.name.clone(),
                expected: self.num_input_channels,
                found: channels,
            });
        }
        let ((out_h, crop_top), (out_w, crop_left)) = self.geometry(height, width)?;

        // H' = (H - 1) * stride + HH
        let full_h = (height - 1) * self.stride + self.kernel_height;
        let full_w = (width - 1) * self.stride + self.kernel_width;
        let mut full: Array3<ImagePrecision> =
            Array::zeros((self.num_output_channels, full_h, full_w));

        let flat = image
            .as_standard_layout()
            .into_owned()
            .into_shape((channels, height * width))?;

        for ki in 0..self.kernel_height {
            let row_end = ki + (height - 1) * self.stride + 1;
            for kj in 0..self.kernel_width {
                let col_end = kj + (width - 1) * self.stride + 1;
                let taps = self.kernel.slice(s![.., .., ki, kj]);
                let contribution = taps
                    .t()
                    .dot(&flat)
                    .into_shape((self.num_output_channels, height, width))?;
                let mut target = full.slice_mut(s![
                    ..,
                    ki..row_end;self.stride,
                    kj..col_end;self.stride
                ]);
                target += &contribution;
            }
        }

        // Crop (Same) or zero-extend (kernel smaller than stride) to the output size
        let rows = out_h.min(full_h - crop_top);
        let cols = out_w.min(full_w - crop_left);
        let mut output: Array3<ImagePrecision> =
            Array::zeros((self.num_output_channels, out_h, out_w));
        output.slice_mut(s![.., ..rows, ..cols]).assign(&full.slice(s![
            ..,
            crop_top..crop_top + rows,
            crop_left..crop_left + cols
        ]));

        output += &self
            .bias
            .view()
            .insert_axis(Axis(1))
            .insert_axis(Axis(2));
        self.activation.apply_inplace(&mut output);
        Ok(output)
    }
}

impl Layer for TransposedConvolutionLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: Shape) -> ModelResult<Shape> {
        if input.channels != self.num_input_channels {
            return Err(ModelError::ChannelMismatch {
                layer: self.name.clone(),
                expected: self.num_input_channels,
                found: input.channels,
            });
        }
        let ((out_h, _), (out_w, _)) = self.geometry(input.height, input.width)?;
        Ok(Shape::new(self.num_output_channels, out_h, out_w))
    }

    fn forward(&self, input: &Batch, _mode: Mode) -> ModelResult<Batch> {
        let shape = self.output_shape(Shape::of_batch(input))?;
        let mut output = Batch::zeros((
            input.len_of(Axis(0)),
            shape.channels,
            shape.height,
            shape.width,
        ));
        for (image, mut out) in input.outer_iter().zip(output.outer_iter_mut()) {
            out.assign(&self.transposed_convolve_view(image)?);
        }
        Ok(output)
    }

    fn num_parameters(&self) -> usize {
        self.kernel.len() + self.bias.len()
    }

    fn parameters(&self) -> Vec<NamedParameter<'_>> {
        vec![
            (format!("{}/kernel", self.name), self.kernel.view().into_dyn()),
            (format!("{}/bias", self.name), self.bias.view().into_dyn()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(
        kernel: ConvKernel,
        bias: f32,
        stride: usize,
        padding: Padding,
    ) -> TransposedConvolutionLayer {
        let filters = kernel.len_of(Axis(1));
        TransposedConvolutionLayer::new(
            "deconv",
            kernel,
            Array::from_elem(filters, bias),
            stride,
            padding,
            Activation::Linear,
        )
        .unwrap()
    }

    #[test]
    fn test_2d_conv_transposed() {
        let test_img = array![[[55.0, 52.0], [57.0, 50.0],]];
        let kernel = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.]).unwrap();
        let conv_t_layer = layer(kernel, 0., 1, Padding::Valid);

        let convolved_image = conv_t_layer.transposed_convolve(&test_img).unwrap();
        let output1 = arr3(&[[
            [55.0, 162.0, 104.0],
            [222.0, 540.0, 308.0],
            [171.0, 378.0, 200.0],
        ]]);
        assert_eq!(convolved_image, output1);

        let kernel_same = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.]).unwrap();
        let conv_t_layer_same = layer(kernel_same, 0., 1, Padding::Same);
        let convolved_image_same = conv_t_layer_same.transposed_convolve(&test_img).unwrap();

        let output_same = arr3(&[[[55.0, 162.0], [222.0, 540.0]]]);
        assert_eq!(convolved_image_same, output_same);
    }

    #[test]
    fn test_strided_same_upsamples() {
        let test_img = array![[[1., 2.], [3., 4.]]];
        let conv_t_layer = layer(Array::ones((1, 1, 3, 3)), 0., 2, Padding::Same);

        let upsampled = conv_t_layer.transposed_convolve(&test_img).unwrap();
        assert_eq!(
            upsampled,
            array![[
                [1., 1., 3., 2.],
                [1., 1., 3., 2.],
                [4., 4., 10., 6.],
                [3., 3., 7., 4.]
            ]]
        );
    }

    #[test]
    fn test_kernel_smaller_than_stride() {
        let test_img = array![[[1., 2.]]];
        let conv_t_layer = layer(Array::ones((1, 1, 1, 1)), 0.5, 2, Padding::Same);

        let upsampled = conv_t_layer.transposed_convolve(&test_img).unwrap();
        assert_eq!(
            upsampled,
            array![[[1.5, 0.5, 2.5, 0.5], [0.5, 0.5, 0.5, 0.5]]]
        );
    }

    #[test]
    fn test_channel_mixing_and_shapes() {
        // two input channels summed into one output channel
        let conv_t_layer = layer(Array::ones((2, 1, 1, 1)), 0., 1, Padding::Valid);
        let batch = Array::from_shape_vec((1, 2, 1, 2), vec![1., 2., 10., 20.]).unwrap();
        let out = conv_t_layer.forward(&batch, Mode::Inference).unwrap();
        assert_eq!(out, Array::from_shape_vec((1, 1, 1, 2), vec![11., 22.]).unwrap());

        let wide = layer(Array::ones((2, 5, 3, 3)), 0., 2, Padding::Valid);
        assert_eq!(
            wide.output_shape(Shape::new(2, 4, 5)).unwrap(),
            Shape::new(5, 9, 11)
        );
        assert!(wide.output_shape(Shape::new(3, 4, 5)).is_err());
        assert_eq!(wide.num_parameters(), 2 * 5 * 9 + 5);
    }
}
