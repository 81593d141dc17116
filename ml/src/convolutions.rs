use crate::{
    activation_functions::Activation,
    model_errors::{ModelError, ModelResult},
    models::{Layer, Mode, NamedParameter, Shape},
    weight_loader::WeightLoader,
    Batch, ConvKernel, ImagePrecision, InternalDataRepresentation, WeightPrecision,
};
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

/// Padding scheme, with the semantics of tensorflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Output length is ceil(input / stride). Odd amounts of padding put the
    /// extra row (column) at the bottom (right).
    Same,
    /// No padding at all.
    Valid,
}

/// Geometry of a convolution along one axis: (output length, padding before, padding after).
/// Returns None if the input is too small for the kernel.
pub(crate) fn conv_axis_geometry(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Option<(usize, usize, usize)> {
    if input == 0 {
        return None;
    }
    match padding {
        Padding::Same => {
            let out = (input + stride - 1) / stride;
            let total = ((out - 1) * stride + kernel).saturating_sub(input);
            Some((out, total / 2, total - total / 2))
        }
        Padding::Valid => {
            if input < kernel {
                None
            } else {
                Some(((input - kernel) / stride + 1, 0, 0))
            }
        }
    }
}

/// Rust implementation of a convolutional layer.
/// The weight matrix shall have dimension (in that order)
/// output channels x input channels x kernel height x kernel width
/// (to comply with the order in which pytorch weights are saved).
pub struct ConvolutionLayer {
    name: String,
    /// Weight matrix of the kernel
    kernel: ConvKernel,
    /// Kernel flattened to (output channels, input channels * kernel height * kernel width)
    kernel_matrix: Array2<WeightPrecision>,
    bias: Array1<WeightPrecision>,
    kernel_height: usize,
    kernel_width: usize,
    stride: usize,
    padding: Padding,
    activation: Activation,
    num_input_channels: usize,
    num_output_channels: usize,
}

impl ConvolutionLayer {
    pub fn new(
        name: &str,
        weights: ConvKernel,
        bias: Array1<WeightPrecision>,
        stride: usize,
        padding: Padding,
        activation: Activation,
    ) -> ModelResult<ConvolutionLayer> {
        let (num_output_channels, num_input_channels, kernel_height, kernel_width) = weights.dim();

        if stride == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "{}: stride must be positive",
                name
            )));
        }
        if kernel_height == 0 || kernel_width == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "{}: kernel must not be empty",
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

        let kernel_matrix = weights.as_standard_layout().into_owned().into_shape((
            num_output_channels,
            num_input_channels * kernel_height * kernel_width,
        ))?;

        Ok(ConvolutionLayer {
            name: name.to_string(),
            kernel: weights,
            kernel_matrix,
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

    /// Builds a square-kernel layer with parameters `<name>/kernel` and `<name>/bias`
    /// taken from the loader.
    pub fn from_loader<L: WeightLoader>(
        loader: &mut L,
        name: &str,
        input_channels: usize,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        activation: Activation,
    ) -> ModelResult<ConvolutionLayer> {
        let kernel: ConvKernel = loader.get_weight(
            &format!("{}/kernel", name),
            (filters, input_channels, kernel_size, kernel_size),
        )?;
        let bias: Array1<WeightPrecision> =
            loader.get_weight(&format!("{}/bias", name), filters)?;
        ConvolutionLayer::new(name, kernel, bias, stride, padding, activation)
    }

    /// Output size and paddings ((out_h, top, bottom), (out_w, left, right)).
    fn geometry(
        &self,
        height: usize,
        width: usize,
    ) -> ModelResult<((usize, usize, usize), (usize, usize, usize))> {
        let vertical = conv_axis_geometry(height, self.kernel_height, self.stride, self.padding);
        let horizontal = conv_axis_geometry(width, self.kernel_width, self.stride, self.padding);
        match (vertical, horizontal) {
            (Some(v), Some(h)) => Ok((v, h)),
            _ => Err(ModelError::InputTooSmall {
                layer: self.name.clone(),
                height,
                width,
            }),
        }
    }

    /// Performs a convolution on the given image data using this layers parameters.
    /// The image is unrolled in im2col style, so the convolution becomes a single
    /// matrix product.
    /// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
    pub fn convolve(
        &self,
        image: &InternalDataRepresentation,
    ) -> ModelResult<InternalDataRepresentation> {
        self.convolve_view(image.view())
    }

    fn convolve_view(
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
        let ((out_h, pad_top, pad_bottom), (out_w, pad_left, pad_right)) =
            self.geometry(height, width)?;

        let mut padded: Array3<ImagePrecision> = Array::zeros((
            channels,
            height + pad_top + pad_bottom,
            width + pad_left + pad_right,
        ));
        padded
            .slice_mut(s![.., pad_top..pad_top + height, pad_left..pad_left + width])
            .assign(&image);

        let columns = self.im2col(padded.view(), out_h, out_w);
        let mut out = self.kernel_matrix.dot(&columns.t());
        out += &self.bias.view().insert_axis(Axis(1));
        self.activation.apply_inplace(&mut out);

        // the product comes out in column major order for single-column kernels
        let out = out.as_standard_layout().into_owned();
        Ok(out.into_shape((self.num_output_channels, out_h, out_w))?)
    }

    /// Unrolls every receptive field of the (already padded) image into one row.
    /// Row entries are ordered (channel, kernel row, kernel column), matching the
    /// flattened kernel.
    fn im2col(
        &self,
        padded: ArrayView3<ImagePrecision>,
        out_h: usize,
        out_w: usize,
    ) -> Array2<ImagePrecision> {
        let patch_len = padded.len_of(Axis(0)) * self.kernel_height * self.kernel_width;
        let mut columns = Array2::zeros((out_h * out_w, patch_len));
        for i in 0..out_h {
            let top = i * self.stride;
            for j in 0..out_w {
                let left = j * self.stride;
                let patch = padded.slice(s![
                    ..,
                    top..top + self.kernel_height,
                    left..left + self.kernel_width
                ]);
                let mut row = columns.row_mut(i * out_w + j);
                for (dst, src) in row.iter_mut().zip(patch.iter()) {
                    *dst = *src;
                }
            }
        }
        columns
    }
}

impl Layer for ConvolutionLayer {
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
        let ((out_h, _, _), (out_w, _, _)) = self.geometry(input.height, input.width)?;
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
            out.assign(&self.convolve_view(image)?);
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

    fn layer(kernel: ConvKernel, bias: f32, stride: usize, padding: Padding) -> ConvolutionLayer {
        let filters = kernel.len_of(Axis(0));
        ConvolutionLayer::new(
            "conv",
            kernel,
            Array::from_elem(filters, bias),
            stride,
            padding,
            Activation::Linear,
        )
        .unwrap()
    }

    #[test]
    fn test_2d_conv() {
        let test_img = array![
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ],
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ],
            [
                [1.0, 2.0, 3.0, 4.0],
                [4.0, 5.0, 6.0, 7.0],
                [7.0, 8.0, 9.0, 9.0],
                [7.0, 8.0, 9.0, 9.0]
            ]
        ];
        let kernel = Array::from_shape_vec(
            (1, 3, 2, 2),
            vec![1., 2., 1., 2., 1., 2., 1., 2., 1., 2., 1., 2.],
        )
        .unwrap();
        let conv_layer = layer(kernel, 0., 1, Padding::Valid);
        let output = arr3(&[[
            [57.0, 75.0, 93.0],
            [111.0, 129.0, 141.0],
            [138.0, 156.0, 162.0],
        ]]);
        assert_eq!(conv_layer.convolve(&test_img).unwrap(), output);
    }

    #[test]
    fn test_same_padding_with_stride() {
        let test_img = array![[[1., 2., 3.], [4., 5., 6.], [7., 8., 9.]]];
        let conv_layer = layer(Array::ones((1, 1, 3, 3)), 1., 2, Padding::Same);

        let convolved = conv_layer.convolve(&test_img).unwrap();
        assert_eq!(convolved, array![[[13., 17.], [25., 29.]]]);
    }

    #[test]
    fn test_same_padding_is_asymmetric() {
        // 4x4 input, kernel 3, stride 2: one row/column of padding, at the bottom/right
        let test_img = Array::from_shape_vec((1, 4, 4), (1..=16).map(|x| x as f32).collect())
            .unwrap();
        let conv_layer = layer(Array::ones((1, 1, 3, 3)), 0., 2, Padding::Same);

        let convolved = conv_layer.convolve(&test_img).unwrap();
        assert_eq!(convolved, array![[[54., 45.], [72., 54.]]]);
    }

    /// Direct cross-correlation, zero padded as `conv_axis_geometry` says.
    fn naive_convolve(
        image: &Array3<f32>,
        kernel: &ConvKernel,
        stride: usize,
        padding: Padding,
    ) -> Array3<f32> {
        let (channels, height, width) = image.dim();
        let (filters, _, kh, kw) = kernel.dim();
        let (out_h, top, _) = conv_axis_geometry(height, kh, stride, padding).unwrap();
        let (out_w, left, _) = conv_axis_geometry(width, kw, stride, padding).unwrap();
        Array3::from_shape_fn((filters, out_h, out_w), |(f, i, j)| {
            let mut acc = 0.;
            for c in 0..channels {
                for u in 0..kh {
                    for v in 0..kw {
                        let y = (i * stride + u) as isize - top as isize;
                        let x = (j * stride + v) as isize - left as isize;
                        if y >= 0 && x >= 0 && (y as usize) < height && (x as usize) < width {
                            acc += image[[c, y as usize, x as usize]] * kernel[[f, c, u, v]];
                        }
                    }
                }
            }
            acc
        })
    }

    #[test]
    fn test_matches_direct_cross_correlation() {
        // (channels, filters, kernel size, stride)
        let cases = [(1, 2, 1, 1), (1, 1, 1, 2), (2, 3, 3, 2), (2, 2, 1, 2), (3, 2, 3, 1)];
        for &(channels, filters, k, stride) in cases.iter() {
            for &padding in [Padding::Same, Padding::Valid].iter() {
                let image = Array::from_shape_fn((channels, 3, 4), |(c, h, w)| {
                    (c * 12 + h * 4 + w) as f32
                });
                let kernel = Array::from_shape_fn((filters, channels, k, k), |(f, c, u, v)| {
                    (f as f32 + 1.) * if (c + u + v) % 2 == 0 { 1. } else { -1. }
                });
                let expected = naive_convolve(&image, &kernel, stride, padding);
                let conv_layer = layer(kernel, 0., stride, padding);
                let convolved = conv_layer.convolve(&image).unwrap();
                assert_eq!(
                    convolved, expected,
                    "c={} f={} k={} s={} {:?}",
                    channels, filters, k, stride, padding
                );
            }
        }
    }

    #[test]
    fn test_single_channel_pointwise_keeps_orientation() {
        let image = Array::from_shape_fn((1, 3, 4), |(_, h, w)| (h * 4 + w) as f32);
        let conv_layer = layer(
            Array::from_shape_vec((2, 1, 1, 1), vec![-1., 2.]).unwrap(),
            0.,
            1,
            Padding::Same,
        );
        let convolved = conv_layer.convolve(&image).unwrap();
        assert_eq!(convolved.dim(), (2, 3, 4));
        assert_eq!(convolved.slice(s![0, 0, ..]), array![0f32, -1., -2., -3.]);
        assert_eq!(convolved.slice(s![1, 2, ..]), array![16f32, 18., 20., 22.]);
    }

    #[test]
    fn test_relu_activation_and_batches() {
        let conv_layer = ConvolutionLayer::new(
            "conv",
            Array::ones((2, 1, 1, 1)),
            array![-2., 0.],
            1,
            Padding::Valid,
            Activation::Relu,
        )
        .unwrap();
        let batch = Array::from_shape_vec((2, 1, 1, 2), vec![1., 3., -1., 5.]).unwrap();
        let out = conv_layer.forward(&batch, Mode::Inference).unwrap();
        assert_eq!(
            out,
            Array::from_shape_vec((2, 2, 1, 2), vec![0., 1., 1., 3., 0., 3., 0., 5.]).unwrap()
        );
    }

    #[test]
    fn test_output_shape_checks() {
        let conv_layer = layer(Array::ones((4, 3, 3, 3)), 0., 2, Padding::Valid);
        assert_eq!(
            conv_layer.output_shape(Shape::new(3, 7, 8)).unwrap(),
            Shape::new(4, 3, 3)
        );
        assert!(matches!(
            conv_layer.output_shape(Shape::new(1, 7, 7)),
            Err(ModelError::ChannelMismatch { .. })
        ));
        assert!(matches!(
            conv_layer.output_shape(Shape::new(3, 2, 7)),
            Err(ModelError::InputTooSmall { .. })
        ));
        assert_eq!(conv_layer.num_parameters(), 4 * 3 * 3 * 3 + 4);
    }

    #[test]
    fn test_invalid_construction() {
        let zero_stride = ConvolutionLayer::new(
            "conv",
            Array::ones((1, 1, 3, 3)),
            array![0.],
            0,
            Padding::Same,
            Activation::Linear,
        );
        assert!(zero_stride.is_err());

        let wrong_bias = ConvolutionLayer::new(
            "conv",
            Array::ones((2, 1, 3, 3)),
            array![0.],
            1,
            Padding::Same,
            Activation::Linear,
        );
        assert!(wrong_bias.is_err());
    }

    #[test]
    fn test_same_geometry() {
        assert_eq!(conv_axis_geometry(28, 3, 2, Padding::Same), Some((14, 0, 1)));
        assert_eq!(conv_axis_geometry(7, 3, 2, Padding::Same), Some((4, 1, 1)));
        assert_eq!(conv_axis_geometry(5, 3, 1, Padding::Same), Some((5, 1, 1)));
        assert_eq!(conv_axis_geometry(2, 3, 1, Padding::Valid), None);
        assert_eq!(conv_axis_geometry(0, 3, 1, Padding::Same), None);
    }
}
