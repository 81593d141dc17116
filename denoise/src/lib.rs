//! Image pre- and postprocessing for the denoising autoencoder, plus the
//! statistics used to judge a reconstruction.
use std::{
    ffi::OsStr,
    fmt::Display,
    path::{Path, PathBuf},
};

use image::{imageops::FilterType, io::Reader as ImageReader, DynamicImage, GenericImageView};
use image::{GrayImage, RgbImage};
use log::{debug, warn};
use ml::{denoise::DenoiseConfig, model_errors::ModelError};
use ndarray::{Array, Array3, ShapeError};
use ndarray_npy::{read_npy, write_npy, ReadNpyError, WriteNpyError};
use nshare::ToNdarray3;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Could not read or write image:\n {0}")]
    Image(#[from] image::ImageError),
    #[error("Filesystem reported error\n {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not read array:\n {0}")]
    ReadNpy(#[from] ReadNpyError),
    #[error("Could not write array:\n {0}")]
    WriteNpy(#[from] WriteNpyError),
    #[error("Could not assemble batch:\n {0}")]
    Shape(#[from] ShapeError),
    #[error("Unsupported image {path}: {reason}")]
    UnsupportedImage { path: String, reason: String },
    #[error("Images have different shapes {0:?} and {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
    #[error("Could not parse filter list {0:?}, expected comma separated positive integers")]
    FilterList(String),
    #[error("No images given")]
    NoImages,
    #[error("Could not open log file:\n {0}")]
    LogFile(#[from] tracing_appender::rolling::InitError),
}

pub type DenoiseResult<T> = std::result::Result<T, CliError>;

fn unsupported(path: &Path, reason: &str) -> CliError {
    CliError::UnsupportedImage {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_lowercase()
}

/// Returns the image as pre-scaled (channels, height, width) array, ready to be put into an
/// encoder. Only grayscale (depth 1) and rgb (depth 3) images are supported.
pub fn image_to_ndarray(img: &DynamicImage, depth: usize) -> Option<Array3<f32>> {
    let pixels = match depth {
        3 => img.to_rgb8().into_ndarray3(),
        1 => {
            let gray = img.to_luma8();
            let (width, height) = gray.dimensions();
            Array::from_shape_vec((1, height as usize, width as usize), gray.into_raw()).ok()?
        }
        _ => return None,
    };
    Some(pixels.mapv(|x| x as f32 / 255.0))
}

/// Turns output from neural net into a pixel value
pub fn to_pixel(x: f32) -> u8 {
    (x.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Turns a (channels, height, width) array with 1 or 3 channels into an image.
pub fn array_to_image(arr: Array3<u8>) -> Option<DynamicImage> {
    let (channels, height, width) = arr.dim();
    // we get the image in PT layout, which is (C,H,W), but need (H,W,C)
    let permuted_view = arr.view().permuted_axes([1, 2, 0]);
    let raw: Vec<u8> = permuted_view.iter().copied().collect();

    match channels {
        3 => RgbImage::from_raw(width as u32, height as u32, raw).map(DynamicImage::ImageRgb8),
        1 => GrayImage::from_raw(width as u32, height as u32, raw).map(DynamicImage::ImageLuma8),
        _ => None,
    }
}

/// Returns a preprocessed image from the path, matching the model's input.
/// `.npy` arrays are taken as they are, pictures are resized to the model size.
pub fn load_image(path: &Path, config: &DenoiseConfig) -> DenoiseResult<Array3<f32>> {
    match extension(path).as_str() {
        "npy" => Ok(read_npy(path)?),
        "png" | "jpg" | "jpeg" | "bmp" => {
            let mut img = ImageReader::open(path)?.decode()?;
            let (width, height) = img.dimensions();
            if (width as usize, height as usize) != (config.width, config.height) {
                warn!(
                    "Resizing {} from {}x{} to {}x{}",
                    path.display(),
                    width,
                    height,
                    config.width,
                    config.height
                );
                img = img.resize_exact(
                    config.width as u32,
                    config.height as u32,
                    FilterType::Triangle,
                );
            }
            image_to_ndarray(&img, config.depth)
                .ok_or_else(|| unsupported(path, "only depth 1 and 3 can be read from pictures"))
        }
        _ => Err(unsupported(
            path,
            "only .jpg, .png, .bmp and .npy are supported",
        )),
    }
}

/// Returns image without preprocessing as rgb pixels.
/// Only useable for actual images, not npy arrays.
pub fn load_pixels(path: &Path) -> DenoiseResult<Array3<u8>> {
    Ok(ImageReader::open(path)?.decode()?.to_rgb8().into_ndarray3())
}

/// Like [`load_pixels`], but resizes the image to `width` x `height` if it has another size.
pub fn load_pixels_resized(path: &Path, width: u32, height: u32) -> DenoiseResult<Array3<u8>> {
    let mut img = ImageReader::open(path)?.decode()?;
    let (img_width, img_height) = img.dimensions();
    if (img_width, img_height) != (width, height) {
        warn!(
            "Resizing {} from {}x{} to {}x{} for comparison",
            path.display(),
            img_width,
            img_height,
            width,
            height
        );
        img = img.resize_exact(width, height, FilterType::Triangle);
    }
    Ok(img.to_rgb8().into_ndarray3())
}

/// Writes the network output, as `.npy` array or as picture depending on the extension.
pub fn save_image(path: &Path, data: &Array3<f32>) -> DenoiseResult<()> {
    if extension(path) == "npy" {
        write_npy(path, data)?;
    } else {
        let img = array_to_image(data.mapv(to_pixel))
            .ok_or_else(|| unsupported(path, "only depth 1 and 3 can be saved as pictures"))?;
        img.save(path)?;
    }
    debug!("Saved {}", path.display());
    Ok(())
}

/// `<dir>/<stem>-<suffix>.<ext>` next to the input, keeping `.npy` for arrays and using png
/// otherwise.
pub fn default_output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = if extension(input) == "npy" { "npy" } else { "png" };
    input.with_file_name(format!("{}-{}.{}", stem, suffix, ext))
}

fn mse(orig: &Array3<u8>, rec: &Array3<u8>) -> f64 {
    let orig_f = orig.mapv(|a| a as f64);
    let rec_f = rec.mapv(|a| a as f64);
    (orig_f - rec_f).mapv(|a| a.powi(2)).sum() / (orig.len() as f64)
}

fn calc_psnr(orig: &Array3<u8>, rec: &Array3<u8>) -> f64 {
    let max_sq = (255f64).powi(2);
    10.0 * (max_sq / mse(orig, rec)).log10()
}

/// Reconstruction quality of a candidate image against a reference.
pub struct Statistics {
    pub mse: f64,
    pub psnr: f64,
}

impl Statistics {
    pub fn new(reference: &Array3<u8>, candidate: &Array3<u8>) -> DenoiseResult<Statistics> {
        if reference.shape() != candidate.shape() {
            return Err(CliError::ShapeMismatch(
                reference.shape().to_vec(),
                candidate.shape().to_vec(),
            ));
        }
        Ok(Statistics {
            mse: mse(reference, candidate),
            psnr: calc_psnr(reference, candidate),
        })
    }
}

impl Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MSE: {}\nPSNR: {} dB", self.mse, self.psnr)
    }
}
