use crate::{models::NamedParameter, WeightPrecision};
use log::debug;
use ndarray::{Array, ArrayBase, Dimension, ShapeError, StrideShape};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};
use serde_json::{self, Map, Value};
use std::io::{Cursor, Read, Seek};
use std::{fs, path::Path};
use thiserror::Error;

type WeightResult<T> = Result<T, WeightError>;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("No weights with name {0} found")]
    WeightKeyError(String),
    #[error("Weight file didn't have the correct format (required: JSON dict of pairs (key, flattened array of weights))")]
    WeightFormatError,
    #[error("Weight file not found. Filesystem reported error\n {0}.")]
    WeightFileNotFoundError(#[from] std::io::Error),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpzError(#[from] ReadNpzError),
    #[error("Weight file not writable. Filesystem reported error\n {0}.")]
    WeightFileNpzWriteError(#[from] WriteNpzError),
    #[error("Wrong shape for weight:\n {0}.")]
    WeightShapeError(#[from] ShapeError),
    #[error("Weight {name} has shape {found:?}, expected {expected:?}.")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

pub trait WeightLoader {
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>;
}

pub struct JsonWeightLoader {
    content: Map<String, Value>,
}

impl JsonWeightLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> WeightResult<JsonWeightLoader> {
        let raw_file = fs::read_to_string(path)?;
        JsonWeightLoader::from_json(&raw_file)
    }

    pub fn from_json(raw: &str) -> WeightResult<JsonWeightLoader> {
        let parsed: Value = serde_json::from_str(raw).map_err(|_| WeightError::WeightFormatError)?;
        match parsed {
            Value::Object(content) => Ok(JsonWeightLoader { content }),
            _ => Err(WeightError::WeightFormatError),
        }
    }
}

impl WeightLoader for JsonWeightLoader {
    /// Returns weights with the given name from the weight loader. Weights are stored in a
    /// FLATTENED form (to facilitate working with JSON, as then all arrays have the same length.)
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        let raw_arr = self
            .content
            .get(param_name)
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?;

        let raw_value_vector = match raw_arr {
            Value::Array(v) => v,
            _ => return Err(WeightError::WeightFormatError),
        };

        let weight_vector: Result<Vec<_>, _> = raw_value_vector
            .iter()
            .map(|j| {
                j.as_f64()
                    .map(|v| v as f32)
                    .ok_or(WeightError::WeightFormatError)
            })
            .collect();

        let weights = Array::from_shape_vec(shape, weight_vector?)?;

        Ok(weights)
    }
}

pub struct NpzWeightLoader<R>
where
    R: Seek + Read,
{
    handle: R,
}

impl NpzWeightLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightLoader<std::fs::File>> {
        let handle = std::fs::File::open(path)?;
        Ok(NpzWeightLoader { handle })
    }
}

impl<'a> NpzWeightLoader<Cursor<&'a [u8]>> {
    pub fn from_buffer(bytes_array: &'a [u8]) -> WeightResult<NpzWeightLoader<Cursor<&'a [u8]>>> {
        Ok(NpzWeightLoader {
            handle: Cursor::new(bytes_array),
        })
    }
}

impl<R> WeightLoader for NpzWeightLoader<R>
where
    R: Seek + Read,
{
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        // The reader in the npy package has to be mut, so we recreate it for every weight.
        let mut reader = NpzReader::new(&mut self.handle)?;

        let arr: ArrayBase<_, D> = reader.by_name(param_name)?;

        let expected = shape.into().raw_dim().clone();
        if arr.raw_dim() != expected {
            return Err(WeightError::WeightShapeMismatch {
                name: param_name.to_string(),
                expected: expected.slice().to_vec(),
                found: arr.shape().to_vec(),
            });
        }
        Ok(arr)
    }
}

/// Produces freshly initialized weights instead of reading them, with the
/// initializers keras uses by default: Glorot uniform for kernels, zeros for
/// biases, betas and moving means, ones for gammas and moving variances.
///
/// The kind of parameter is derived from the last path segment of its name.
pub struct RandomWeightLoader {
    rng: StdRng,
}

impl RandomWeightLoader {
    pub fn new(seed: u64) -> RandomWeightLoader {
        RandomWeightLoader {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Glorot uniform limit sqrt(6 / (fan_in + fan_out)). For a kernel of
    /// shape (a, b, kh, kw) the fans are a * kh * kw and b * kh * kw; as only
    /// their sum matters, the layout of transposed kernels makes no difference.
    fn glorot_limit(dims: &[usize]) -> f32 {
        let (fan_in, fan_out) = match dims {
            [] => (1, 1),
            [n] => (*n, *n),
            [a, b] => (*a, *b),
            [a, b, rest @ ..] => {
                let receptive_field: usize = rest.iter().product();
                (a * receptive_field, b * receptive_field)
            }
        };
        (6.0 / (fan_in + fan_out).max(1) as f32).sqrt()
    }
}

impl WeightLoader for RandomWeightLoader {
    fn get_weight<D, Sh>(
        &mut self,
        param_name: &str,
        shape: Sh,
    ) -> WeightResult<Array<WeightPrecision, D>>
    where
        D: Dimension,
        Sh: Into<StrideShape<D>>,
    {
        let dim = shape.into().raw_dim().clone();
        let kind = param_name.rsplit('/').next().unwrap_or(param_name);
        let weights = match kind {
            "kernel" => {
                let limit = RandomWeightLoader::glorot_limit(dim.slice());
                let distribution = Uniform::new_inclusive(-limit, limit);
                let rng = &mut self.rng;
                Array::from_shape_simple_fn(dim, || rng.sample(distribution))
            }
            "bias" | "beta" | "moving_mean" => Array::zeros(dim),
            "gamma" | "moving_variance" => Array::ones(dim),
            _ => return Err(WeightError::WeightKeyError(param_name.to_string())),
        };
        debug!("Initialized {} with shape {:?}", param_name, weights.shape());
        Ok(weights)
    }
}

/// Writes named parameters into a numpy .npz archive, readable by [`NpzWeightLoader`].
pub fn save_weights<P: AsRef<Path>>(
    path: P,
    parameters: &[NamedParameter<'_>],
) -> WeightResult<()> {
    let file = fs::File::create(path)?;
    let mut npz = NpzWriter::new(file);
    for (name, weights) in parameters {
        npz.add_array(name.as_str(), weights)?;
    }
    npz.finish()?;
    Ok(())
}
