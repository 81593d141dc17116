//! Batch normalization over the channel axis.
//!
//! Refer to Ioffe and Szegedy, 2015, https://arxiv.org/abs/1502.03167.
//! Defaults (epsilon, momentum, initial statistics) follow the keras layer, so weights
//! exported from there can be used unchanged.
use log::trace;
use ndarray::*;

use crate::{
    model_errors::{ModelError, ModelResult},
    models::{Layer, Mode, NamedParameter, Shape},
    weight_loader::WeightLoader,
    Batch, WeightPrecision,
};

pub const DEFAULT_EPSILON: WeightPrecision = 1e-3;
pub const DEFAULT_MOMENTUM: WeightPrecision = 0.99;

pub struct BatchNormalizationLayer {
    name: String,
    gamma: Array1<WeightPrecision>,
    beta: Array1<WeightPrecision>,
    moving_mean: Array1<WeightPrecision>,
    moving_variance: Array1<WeightPrecision>,
    epsilon: WeightPrecision,
    momentum: WeightPrecision,
}

impl BatchNormalizationLayer {
    pub fn new(
        name: &str,
        gamma: Array1<WeightPrecision>,
        beta: Array1<WeightPrecision>,
        moving_mean: Array1<WeightPrecision>,
        moving_variance: Array1<WeightPrecision>,
    ) -> ModelResult<BatchNormalizationLayer> {
        let channels = gamma.len();
        if beta.len() != channels
            || moving_mean.len() != channels
            || moving_variance.len() != channels
        {
            return Err(ModelError::InvalidConfig(format!(
                "{}: gamma, beta, moving mean and moving variance must have the same length",
                name
            )));
        }
        Ok(BatchNormalizationLayer {
            name: name.to_string(),
            gamma,
            beta,
            moving_mean,
            moving_variance,
            epsilon: DEFAULT_EPSILON,
            momentum: DEFAULT_MOMENTUM,
        })
    }

    pub fn from_loader<L: WeightLoader>(
        loader: &mut L,
        name: &str,
        channels: usize,
    ) -> ModelResult<BatchNormalizationLayer> {
        let mut param =
            |p: &str| loader.get_weight::<Ix1, _>(&format!("{}/{}", name, p), channels);
        let gamma = param("gamma")?;
        let beta = param("beta")?;
        let moving_mean = param("moving_mean")?;
        let moving_variance = param("moving_variance")?;
        BatchNormalizationLayer::new(name, gamma, beta, moving_mean, moving_variance)
    }

    pub fn moving_mean(&self) -> &Array1<WeightPrecision> {
        &self.moving_mean
    }

    pub fn moving_variance(&self) -> &Array1<WeightPrecision> {
        &self.moving_variance
    }

    fn normalize(
        &self,
        input: &Batch,
        mean: &Array1<WeightPrecision>,
        variance: &Array1<WeightPrecision>,
    ) -> Batch {
        let mut output = input.clone();
        for (c, mut channel) in output.axis_iter_mut(Axis(1)).enumerate() {
            let scale = self.gamma[c] / (variance[c] + self.epsilon).sqrt();
            let shift = self.beta[c] - mean[c] * scale;
            channel.mapv_inplace(|x| x * scale + shift);
        }
        output
    }

    /// Per-channel mean and (biased) variance over batch, height and width,
    /// together with the number of values per channel.
    fn batch_statistics(
        &self,
        input: &Batch,
    ) -> (Array1<WeightPrecision>, Array1<WeightPrecision>, usize) {
        let channels = input.len_of(Axis(1));
        let mut mean = Array1::zeros(channels);
        let mut variance = Array1::zeros(channels);
        let mut count = 0;
        for (c, channel) in input.axis_iter(Axis(1)).enumerate() {
            count = channel.len();
            let n = count as WeightPrecision;
            let m = channel.sum() / n;
            mean[c] = m;
            variance[c] = channel.fold(0., |acc, &x| acc + (x - m).powi(2)) / n;
        }
        (mean, variance, count)
    }

    fn check_channels(&self, channels: usize) -> ModelResult<()> {
        if channels != self.gamma.len() {
            return Err(ModelError::ChannelMismatch {
                layer: self.name.clone(),
                expected: self.gamma.len(),
                found: channels,
            });
        }
        Ok(())
    }
}

impl Layer for BatchNormalizationLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_shape(&self, input: Shape) -> ModelResult<Shape> {
        self.check_channels(input.channels)?;
        Ok(input)
    }

    fn forward(&self, input: &Batch, mode: Mode) -> ModelResult<Batch> {
        self.check_channels(input.len_of(Axis(1)))?;
        if input.is_empty() {
            return Ok(input.clone());
        }
        match mode {
            Mode::Inference => Ok(self.normalize(input, &self.moving_mean, &self.moving_variance)),
            Mode::Training => {
                let (mean, variance, _) = self.batch_statistics(input);
                Ok(self.normalize(input, &mean, &variance))
            }
        }
    }

    /// Normalizes with the batch statistics and moves the running statistics towards them.
    /// The running variance uses the unbiased estimate, as tensorflow does.
    fn calibrate(&mut self, input: &Batch) -> ModelResult<Batch> {
        self.check_channels(input.len_of(Axis(1)))?;
        if input.is_empty() {
            return Ok(input.clone());
        }
        let (mean, variance, count) = self.batch_statistics(input);
        let correction = if count > 1 {
            count as WeightPrecision / (count - 1) as WeightPrecision
        } else {
            1.0
        };
        let momentum = self.momentum;
        self.moving_mean = &self.moving_mean * momentum + &mean * (1. - momentum);
        self.moving_variance =
            &self.moving_variance * momentum + &variance * (correction * (1. - momentum));
        trace!(
            "{}: moving mean {} moving variance {}",
            self.name,
            self.moving_mean,
            self.moving_variance
        );
        Ok(self.normalize(input, &mean, &variance))
    }

    /// Counts all four per-channel vectors, two of which are not trainable.
    fn num_parameters(&self) -> usize {
        4 * self.gamma.len()
    }

    fn parameters(&self) -> Vec<NamedParameter<'_>> {
        vec![
            (format!("{}/gamma", self.name), self.gamma.view().into_dyn()),
            (format!("{}/beta", self.name), self.beta.view().into_dyn()),
            (
                format!("{}/moving_mean", self.name),
                self.moving_mean.view().into_dyn(),
            ),
            (
                format!("{}/moving_variance", self.name),
                self.moving_variance.view().into_dyn(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &Batch, b: &Batch) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4, "{} != {}", a, b);
        }
    }

    fn single_channel(gamma: f32, beta: f32, mean: f32, variance: f32) -> BatchNormalizationLayer {
        BatchNormalizationLayer::new(
            "bn",
            array![gamma],
            array![beta],
            array![mean],
            array![variance],
        )
        .unwrap()
    }

    #[test]
    fn test_inference_uses_moving_statistics() {
        let bn = single_channel(2., 1., 1., 4. - DEFAULT_EPSILON);
        let x = Array::from_shape_vec((1, 1, 1, 3), vec![1., 3., 5.]).unwrap();
        let y = bn.forward(&x, Mode::Inference).unwrap();
        assert_close(&y, &x);
    }

    #[test]
    fn test_training_uses_batch_statistics() {
        let bn = single_channel(1., 0., 100., 100.);
        let x = Array::from_shape_vec((2, 1, 1, 1), vec![1., 3.]).unwrap();
        let y = bn.forward(&x, Mode::Training).unwrap();
        let expected = 1. / (1. + DEFAULT_EPSILON).sqrt();
        assert_close(
            &y,
            &Array::from_shape_vec((2, 1, 1, 1), vec![-expected, expected]).unwrap(),
        );
    }

    #[test]
    fn test_channels_are_independent() {
        let bn = BatchNormalizationLayer::new(
            "bn",
            array![1., 1.],
            array![0., 10.],
            array![0., 0.],
            array![1. - DEFAULT_EPSILON, 1. - DEFAULT_EPSILON],
        )
        .unwrap();
        let x = Array::from_shape_vec((1, 2, 1, 2), vec![1., 2., 3., 4.]).unwrap();
        let y = bn.forward(&x, Mode::Inference).unwrap();
        assert_close(
            &y,
            &Array::from_shape_vec((1, 2, 1, 2), vec![1., 2., 13., 14.]).unwrap(),
        );
        assert!(bn.forward(&Array::zeros((1, 3, 1, 1)), Mode::Inference).is_err());
        assert_eq!(bn.num_parameters(), 8);
    }

    #[test]
    fn test_calibrate_updates_moving_statistics() {
        let mut bn = single_channel(1., 0., 0., 1.);
        let x = Array::from_shape_vec((2, 1, 1, 1), vec![1., 3.]).unwrap();
        let y = bn.calibrate(&x).unwrap();
        assert_close(&y, &bn.forward(&x, Mode::Training).unwrap());

        assert!((bn.moving_mean()[0] - 0.02).abs() < 1e-6);
        // batch variance 1, unbiased 2
        assert!((bn.moving_variance()[0] - 1.01).abs() < 1e-6);
    }

    #[test]
    fn test_calibrate_with_one_value_per_channel() {
        let mut bn = BatchNormalizationLayer::new(
            "bn",
            array![1., 1.],
            array![0., 0.],
            array![0., 0.],
            array![1., 1.],
        )
        .unwrap();
        let x = Array::from_shape_vec((1, 2, 1, 1), vec![5., -3.]).unwrap();
        let y = bn.calibrate(&x).unwrap();
        assert_close(&y, &Array::zeros((1, 2, 1, 1)));

        assert!((bn.moving_mean()[0] - 0.05).abs() < 1e-6);
        assert!((bn.moving_mean()[1] + 0.03).abs() < 1e-6);
        // a single value has zero variance and no correction is applied
        assert!(bn.moving_variance().iter().all(|v| (v - 0.99).abs() < 1e-6));
    }

    #[test]
    fn test_empty_batch_passes_through() {
        let mut bn = single_channel(2., 1., 3., 4.);
        let empty: Batch = Array::zeros((0, 1, 2, 2));
        assert_eq!(bn.forward(&empty, Mode::Inference).unwrap().dim(), (0, 1, 2, 2));
        assert_eq!(bn.forward(&empty, Mode::Training).unwrap().dim(), (0, 1, 2, 2));
        assert_eq!(bn.calibrate(&empty).unwrap().dim(), (0, 1, 2, 2));
        assert_eq!(bn.moving_mean(), &array![3f32]);
        assert_eq!(bn.moving_variance(), &array![4f32]);

        let wrong_channels: Batch = Array::zeros((0, 3, 2, 2));
        assert!(bn.forward(&wrong_channels, Mode::Inference).is_err());
        assert!(bn.calibrate(&wrong_channels).is_err());
    }

    #[test]
    fn test_mismatched_parameters() {
        let bn =
            BatchNormalizationLayer::new("bn", array![1.], array![0., 0.], array![0.], array![1.]);
        assert!(bn.is_err());
    }
}
