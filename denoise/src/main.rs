//! This crate ties in the autoencoder and provides a clean command line interface
//! to create models and denoise images with them.

use denoise::{
    default_output_path, load_image, load_pixels, load_pixels_resized, save_image, CliError,
    DenoiseResult, Statistics,
};
use env_logger::{Builder, Target};
use log::info;
use ml::{
    denoise::{Denoise, DenoiseConfig, CONFIG_FILE},
    functional::build_autoencoder,
    weight_loader::RandomWeightLoader,
};
use ndarray::{stack, Axis};
use quicli::prelude::{CliResult, Verbosity};
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    str::FromStr,
};
use structopt::StructOpt;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Log files are named denoise.<date>.log and rotated at midnight.
const LOG_FILE_PREFIX: &str = "denoise";
const LOG_FILE_SUFFIX: &str = "log";
const LOG_FILES_KEPT: usize = 60;

/// Sends every log record to stderr and to the log file.
struct TeeWriter {
    file: RollingFileAppender,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Comma separated encoder filter widths, e.g. "128,64"
#[derive(Debug)]
struct FilterList(Vec<usize>);

impl FromStr for FilterList {
    type Err = CliError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(FilterList(Vec::new()));
        }
        s.split(',')
            .map(|f| match f.trim().parse::<usize>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(CliError::FilterList(s.to_string())),
            })
            .collect::<DenoiseResult<Vec<_>>>()
            .map(FilterList)
    }
}

#[derive(Debug, StructOpt)]
struct LogOpts {
    /// Additionally writes the log to <log-dir>/denoise.<date>.log, keeping 60 days
    #[structopt(long = "log-dir", parse(from_os_str))]
    log_dir: Option<PathBuf>,
}

/// Creates a model directory with randomly initialized weights
#[derive(Debug, StructOpt)]
struct InitOpts {
    /// Directory the model is written to (config.json and weights.npz)
    #[structopt(parse(from_os_str))]
    model: PathBuf,
    /// Width of the input images
    #[structopt(long = "width")]
    width: usize,
    /// Height of the input images
    #[structopt(long = "height")]
    height: usize,
    /// Number of channels of the input images
    #[structopt(long = "depth", default_value = "3")]
    depth: usize,
    /// Filter widths of the encoder, the decoder uses them in reverse
    #[structopt(long = "filters", default_value = "128,64")]
    filters: FilterList,
    /// Seed for the weight initialization
    #[structopt(long = "seed", default_value = "0")]
    seed: u64,
    #[structopt(flatten)]
    verbosity: Verbosity,
    #[structopt(flatten)]
    logging: LogOpts,
}

/// Prints the layers of a model
#[derive(Debug, StructOpt)]
struct SummaryOpts {
    /// Model directory
    #[structopt(parse(from_os_str))]
    model: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
    #[structopt(flatten)]
    logging: LogOpts,
}

/// Denoises an image
#[derive(Debug, StructOpt)]
struct RunOpts {
    /// Model directory
    #[structopt(parse(from_os_str))]
    model: PathBuf,
    /// Path to the noisy image (.png, .jpg, .bmp or .npy)
    #[structopt(parse(from_os_str))]
    image: PathBuf,
    /// Output path, writes to /path/to/image-denoised.png if not available
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
    #[structopt(flatten)]
    logging: LogOpts,
}

/// Recomputes the batch normalization statistics from example images
#[derive(Debug, StructOpt)]
struct CalibrateOpts {
    /// Model directory, its weights are overwritten
    #[structopt(parse(from_os_str))]
    model: PathBuf,
    /// Images forming one batch
    #[structopt(parse(from_os_str))]
    images: Vec<PathBuf>,
    /// Number of passes over the batch
    #[structopt(long = "passes", default_value = "1")]
    passes: usize,
    #[structopt(flatten)]
    verbosity: Verbosity,
    #[structopt(flatten)]
    logging: LogOpts,
}

/// Compares two images. A candidate of another size is resized to the reference first.
#[derive(Debug, StructOpt)]
struct StatsOpts {
    /// Path to the clean reference image
    #[structopt(parse(from_os_str))]
    reference: PathBuf,
    /// Path to the image to judge
    #[structopt(parse(from_os_str))]
    candidate: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
    #[structopt(flatten)]
    logging: LogOpts,
}

/// Denoise images using a convolutional autoencoder.
#[derive(Debug, StructOpt)]
#[structopt(name = "denoise")]
enum DenoiseCli {
    #[structopt(
        name = "init",
        about = "Creates a new model with randomly initialized weights."
    )]
    Init(InitOpts),
    #[structopt(
        name = "summary",
        about = "Prints encoder and decoder layers with output shapes and parameter counts."
    )]
    Summary(SummaryOpts),
    #[structopt(name = "run", about = "Denoises an image with a model.")]
    Run(RunOpts),
    #[structopt(
        name = "calibrate",
        about = "Updates the batch normalization statistics of a model from a set of images."
    )]
    Calibrate(CalibrateOpts),
    #[structopt(
        name = "statistics",
        about = "Prints MSE and PSNR of an image against a reference, resizing the candidate \
                 to the reference size if needed."
    )]
    Statistics(StatsOpts),
}

/// Trait for the subcommands
trait DenoiseOpts {
    /// Performs the subcommand
    fn run(&self) -> DenoiseResult<()>;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    fn get_logging(&self) -> &LogOpts;
    /// Configures the logger: level from the verbosity, records to stderr and,
    /// with a log directory, to the rotated log file as well
    fn logger(&self) -> DenoiseResult<Builder> {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} {} [{}] {}",
                    buf.timestamp(),
                    record.file().unwrap_or("unknown"),
                    record.level(),
                    record.args()
                )
            });

        if let Some(dir) = &self.get_logging().log_dir {
            fs::create_dir_all(dir)?;
            let file = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix(LOG_FILE_SUFFIX)
                .max_log_files(LOG_FILES_KEPT)
                .build(dir)?;
            builder.target(Target::Pipe(Box::new(TeeWriter { file })));
        }
        Ok(builder)
    }
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        self.logger()?.init();
        Ok(())
    }
}

impl DenoiseOpts for InitOpts {
    fn run(&self) -> DenoiseResult<()> {
        let config = DenoiseConfig::new(self.width, self.height, self.depth)
            .with_filters(self.filters.0.clone());
        let model = Denoise::new(config, &mut RandomWeightLoader::new(self.seed))?;
        model.save_to_directory(&self.model)?;
        info!(
            "Created model with {} parameters in {}",
            model.num_parameters(),
            self.model.display()
        );
        Ok(())
    }
    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
    fn get_logging(&self) -> &LogOpts {
        &self.logging
    }
}

impl DenoiseOpts for SummaryOpts {
    // Only the shapes are needed, so the weights are not read
    fn run(&self) -> DenoiseResult<()> {
        let config = DenoiseConfig::from_path(self.model.join(CONFIG_FILE))?;
        let model = build_autoencoder(&config, &mut RandomWeightLoader::new(0))?;
        println!("{}", model.summary());
        println!("Total params: {}", model.num_parameters());
        Ok(())
    }
    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
    fn get_logging(&self) -> &LogOpts {
        &self.logging
    }
}

impl DenoiseOpts for RunOpts {
    fn run(&self) -> DenoiseResult<()> {
        let model = Denoise::from_directory(&self.model)?;
        let image = load_image(&self.image, model.config())?;
        let denoised = model.denoise_image(&image)?;

        let output = self
            .output
            .clone()
            .unwrap_or_else(|| default_output_path(&self.image, "denoised"));
        save_image(&output, &denoised)?;
        info!("Wrote denoised image to {}", output.display());
        Ok(())
    }
    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
    fn get_logging(&self) -> &LogOpts {
        &self.logging
    }
}

impl DenoiseOpts for CalibrateOpts {
    fn run(&self) -> DenoiseResult<()> {
        if self.images.is_empty() {
            return Err(CliError::NoImages);
        }
        let mut model = Denoise::from_directory(&self.model)?;
        let images = self
            .images
            .iter()
            .map(|path| load_image(path, model.config()))
            .collect::<DenoiseResult<Vec<_>>>()?;
        let views: Vec<_> = images.iter().map(|image| image.view()).collect();
        let batch = stack(Axis(0), &views)?;

        for pass in 0..self.passes {
            model.calibrate(&batch)?;
            info!("Calibration pass {} of {} done", pass + 1, self.passes);
        }
        model.save_to_directory(&self.model)?;
        Ok(())
    }
    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
    fn get_logging(&self) -> &LogOpts {
        &self.logging
    }
}

impl DenoiseOpts for StatsOpts {
    // Prints out statistics to StdOut
    fn run(&self) -> DenoiseResult<()> {
        let reference = load_pixels(&self.reference)?;
        let (_, height, width) = reference.dim();
        let candidate = load_pixels_resized(&self.candidate, width as u32, height as u32)?;
        let stats = Statistics::new(&reference, &candidate)?;
        println!("{}", stats);
        Ok(())
    }
    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
    fn get_logging(&self) -> &LogOpts {
        &self.logging
    }
}

impl DenoiseOpts for DenoiseCli {
    fn run(&self) -> DenoiseResult<()> {
        match self {
            DenoiseCli::Init(c) => c.run(),
            DenoiseCli::Summary(c) => c.run(),
            DenoiseCli::Run(c) => c.run(),
            DenoiseCli::Calibrate(c) => c.run(),
            DenoiseCli::Statistics(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            DenoiseCli::Init(c) => c.get_verbosity(),
            DenoiseCli::Summary(c) => c.get_verbosity(),
            DenoiseCli::Run(c) => c.get_verbosity(),
            DenoiseCli::Calibrate(c) => c.get_verbosity(),
            DenoiseCli::Statistics(c) => c.get_verbosity(),
        }
    }

    fn get_logging(&self) -> &LogOpts {
        match self {
            DenoiseCli::Init(c) => c.get_logging(),
            DenoiseCli::Summary(c) => c.get_logging(),
            DenoiseCli::Run(c) => c.get_logging(),
            DenoiseCli::Calibrate(c) => c.get_logging(),
            DenoiseCli::Statistics(c) => c.get_logging(),
        }
    }
}

fn main() -> CliResult {
    let args = DenoiseCli::from_args();
    args.setup_env_logger()?;
    args.run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use log::{Level, Log, Record};
    use ml::denoise::WEIGHTS_FILE;
    use ndarray::Array3;
    use ndarray_npy::read_npy;
    use std::path::Path;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> DenoiseCli {
        DenoiseCli::from_iter_safe(std::iter::once("denoise").chain(args.iter().cloned())).unwrap()
    }

    fn arg(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    fn init_model(model: &Path, filters: &str) {
        parse(&[
            "init",
            arg(model),
            "--width",
            "8",
            "--height",
            "8",
            "--depth",
            "1",
            "--filters",
            filters,
            "--seed",
            "3",
        ])
        .run()
        .unwrap();
    }

    fn save_noisy_image(path: &Path, width: u32, height: u32) {
        GrayImage::from_fn(width, height, |x, y| Luma([((x * 31 + y * 17) % 256) as u8]))
            .save(path)
            .unwrap();
    }

    fn moving_means(model: &Path) -> Vec<f32> {
        let model = Denoise::from_directory(model).unwrap();
        let means = model
            .parameters()
            .iter()
            .filter(|(name, _)| name.ends_with("/moving_mean"))
            .flat_map(|(_, w)| w.iter().copied())
            .collect();
        means
    }

    #[test]
    fn test_filter_list_parsing() {
        assert_eq!("128,64".parse::<FilterList>().unwrap().0, vec![128, 64]);
        assert_eq!(" 32 , 16,8".parse::<FilterList>().unwrap().0, vec![32, 16, 8]);
        assert!("".parse::<FilterList>().unwrap().0.is_empty());
        assert!("128,0".parse::<FilterList>().is_err());
        assert!("128,x".parse::<FilterList>().is_err());
    }

    #[test]
    fn test_init_writes_model_directory() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("model");
        init_model(&model, "4,2");

        assert!(model.join(CONFIG_FILE).is_file());
        assert!(model.join(WEIGHTS_FILE).is_file());
        let loaded = Denoise::from_directory(&model).unwrap();
        assert_eq!(
            loaded.config(),
            &DenoiseConfig::new(8, 8, 1).with_filters(vec![4, 2])
        );
        parse(&["summary", arg(&model)]).run().unwrap();

        let invalid = parse(&["init", arg(&model), "--width", "0", "--height", "8"]);
        assert!(invalid.run().is_err());
        dir.close().unwrap();
    }

    #[test]
    fn test_run_writes_reconstruction() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("model");
        init_model(&model, "4");
        let noisy = dir.path().join("noisy.png");
        save_noisy_image(&noisy, 8, 8);

        parse(&["run", arg(&model), arg(&noisy)]).run().unwrap();
        let denoised = load_pixels(&dir.path().join("noisy-denoised.png")).unwrap();
        assert_eq!(denoised.dim(), (3, 8, 8));

        let output = dir.path().join("out.npy");
        parse(&["run", arg(&model), arg(&noisy), "-o", arg(&output)])
            .run()
            .unwrap();
        let reconstruction: Array3<f32> = read_npy(&output).unwrap();
        assert_eq!(reconstruction.dim(), (1, 8, 8));
        assert!(reconstruction.iter().all(|&x| x > 0. && x < 1.));

        // pictures of another size are resized to the model
        let large = dir.path().join("large.png");
        save_noisy_image(&large, 12, 10);
        let resized_output = dir.path().join("large.npy");
        parse(&["run", arg(&model), arg(&large), "-o", arg(&resized_output)])
            .run()
            .unwrap();
        let reconstruction: Array3<f32> = read_npy(&resized_output).unwrap();
        assert_eq!(reconstruction.dim(), (1, 8, 8));
        dir.close().unwrap();
    }

    #[test]
    fn test_calibrate_rewrites_weights() {
        let dir = tempdir().unwrap();
        let once = dir.path().join("once");
        let twice = dir.path().join("twice");
        init_model(&once, "4");
        init_model(&twice, "4");
        assert!(moving_means(&once).iter().all(|&m| m == 0.));

        let first = dir.path().join("first.png");
        let second = dir.path().join("second.png");
        save_noisy_image(&first, 8, 8);
        save_noisy_image(&second, 16, 16);

        parse(&["calibrate", arg(&once), arg(&first), arg(&second)])
            .run()
            .unwrap();
        parse(&[
            "calibrate",
            arg(&twice),
            arg(&first),
            arg(&second),
            "--passes",
            "2",
        ])
        .run()
        .unwrap();

        let once_means = moving_means(&once);
        assert!(once_means.iter().any(|&m| m != 0.));
        assert_ne!(once_means, moving_means(&twice));

        assert!(matches!(
            parse(&["calibrate", arg(&once)]).run(),
            Err(CliError::NoImages)
        ));
        dir.close().unwrap();
    }

    #[test]
    fn test_statistics_resizes_candidate() {
        let dir = tempdir().unwrap();
        let reference = dir.path().join("reference.png");
        let candidate = dir.path().join("candidate.png");
        save_noisy_image(&reference, 8, 8);
        save_noisy_image(&candidate, 4, 4);

        parse(&["statistics", arg(&reference), arg(&reference)])
            .run()
            .unwrap();
        parse(&["statistics", arg(&reference), arg(&candidate)])
            .run()
            .unwrap();
        let missing = dir.path().join("missing.png");
        assert!(parse(&["statistics", arg(&reference), arg(&missing)])
            .run()
            .is_err());
        dir.close().unwrap();
    }

    #[test]
    fn test_log_dir_receives_formatted_records() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs").join("denoise");
        let cli = parse(&["summary", "model", "--log-dir", arg(&log_dir)]);
        let logger = cli.logger().unwrap().build();
        assert!(log_dir.is_dir());

        logger.log(
            &Record::builder()
                .args(format_args!("calibrated {} images", 2))
                .level(Level::Error)
                .file(Some("src/main.rs"))
                .build(),
        );
        logger.flush();

        let files: Vec<PathBuf> = fs::read_dir(&log_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("denoise.") && name.ends_with(".log"));

        let content = fs::read_to_string(&files[0]).unwrap();
        let line = content.lines().next().unwrap();
        let (timestamp, rest) = line.split_at(line.find(' ').unwrap());
        assert!(!timestamp.is_empty());
        assert_eq!(rest, " src/main.rs [ERROR] calibrated 2 images");
        dir.close().unwrap();
    }
}
