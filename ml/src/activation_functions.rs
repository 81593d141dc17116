//! This module provides the activation functions used by the autoencoder layers,
//! namely Relu and Sigmoid (plus the identity).
//!
//! All activation functions are exposed through the [`Activation`] enum.
use ndarray::*;
use num::Float;
use serde_derive::{Deserialize, Serialize};

use crate::ImagePrecision;

/// Activation applied elementwise at the end of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
}

impl Activation {
    /// Applies the activation in place.
    pub fn apply_inplace<S, D>(&self, data: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = ImagePrecision>,
        D: Dimension,
    {
        match self {
            Activation::Linear => {}
            Activation::Relu => data.mapv_inplace(relu_scalar),
            Activation::Sigmoid => data.mapv_inplace(sigmoid_scalar),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
        }
    }
}

fn relu_scalar<F: Float>(x: F) -> F {
    if x > F::zero() {
        x
    } else {
        F::zero()
    }
}

fn sigmoid_scalar<F: Float>(x: F) -> F {
    F::one() / (F::one() + (-x).exp())
}
