use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use masked_watermark::{
    is_supported_image, load_luma, save_luma, suffixed_output_path, MaskModel, ReferencePattern,
    WatermarkConfig, WatermarkEngine,
};

#[derive(Parser)]
#[command(
    name = "masked-watermark",
    about = "Embed and detect imperceptible watermarks using NVF and prediction-error masks",
    version,
    after_help = "The reference pattern is a raw file of little-endian f32 samples, \
                  one per pixel,\nin row-major order. Create one with \
                  `masked-watermark generate-pattern`."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Write a seeded Gaussian reference pattern
    GeneratePattern {
        /// Pattern width in pixels
        #[arg(long)]
        width: u32,

        /// Pattern height in pixels
        #[arg(long)]
        height: u32,

        /// Random seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Output pattern file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Embed the watermark and save the marked image(s)
    Embed {
        #[command(flatten)]
        common: CommonArgs,

        /// Target PSNR in dB
        #[arg(long, default_value = "30.0")]
        psnr: f32,

        /// Output file (single model only; default: {name}_W_NVF / {name}_W_ME)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compute the watermark correlation of an image
    Detect {
        #[command(flatten)]
        common: CommonArgs,

        /// Decision threshold for reporting presence
        #[arg(short, long, default_value = "0.1")]
        threshold: f32,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Input image file
    image: PathBuf,

    /// Reference pattern file
    #[arg(long)]
    pattern: PathBuf,

    /// Mask model
    #[arg(short, long, value_enum, default_value_t = ModelArg::Both)]
    model: ModelArg,

    /// Neighborhood size (odd, 3-9)
    #[arg(short, default_value = "5")]
    p: usize,

    /// Worker threads (0 = all cores)
    #[arg(long, default_value = "0")]
    threads: usize,

    /// Repeat each run and report the mean time
    #[arg(long, default_value = "1")]
    loops: u32,

    /// Report timings as frames per second
    #[arg(long)]
    fps: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    Nvf,
    Me,
    Both,
}

impl ModelArg {
    fn models(self) -> &'static [MaskModel] {
        match self {
            Self::Nvf => &[MaskModel::Nvf],
            Self::Me => &[MaskModel::PredictionError],
            Self::Both => &[MaskModel::Nvf, MaskModel::PredictionError],
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let outcome = match &cli.command {
        Command::GeneratePattern {
            width,
            height,
            seed,
            output,
        } => generate_pattern(*width, *height, *seed, output, cli.quiet),
        Command::Embed {
            common,
            psnr,
            output,
        } => embed(common, *psnr, output.as_deref(), cli.quiet),
        Command::Detect { common, threshold } => detect(common, *threshold, cli.quiet),
    };

    if let Err(message) = outcome {
        eprintln!("Error: {message}");
        process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn generate_pattern(
    width: u32,
    height: u32,
    seed: u64,
    output: &Path,
    quiet: bool,
) -> Result<(), String> {
    ReferencePattern::generate(width, height, seed)
        .save(output)
        .map_err(|e| format!("Failed to write pattern: {e}"))?;
    if !quiet {
        eprintln!("[OK] {width}x{height} pattern written to {}", output.display());
    }
    Ok(())
}

fn build_engine(common: &CommonArgs, psnr: f32) -> Result<WatermarkEngine, String> {
    if common.loops == 0 || common.loops > 64 {
        return Err("Loops must be between 1 and 64".to_string());
    }
    if !is_supported_image(&common.image) {
        return Err(format!(
            "Unsupported image format: {} (expected jpg, png, webp or bmp)",
            common.image.display()
        ));
    }
    let image = load_luma(&common.image)
        .map_err(|e| format!("Failed to load {}: {e}", common.image.display()))?;
    let config = WatermarkConfig {
        p: common.p,
        psnr,
        threads: common.threads,
    };
    WatermarkEngine::with_pattern_file(image, &common.pattern, config)
        .map_err(|e| format!("Failed to initialize engine: {e}"))
}

/// Run `f` `loops` times, returning the last result and the mean seconds per run.
fn timed<T>(
    loops: u32,
    mut f: impl FnMut() -> masked_watermark::Result<T>,
) -> masked_watermark::Result<(T, f64)> {
    let start = Instant::now();
    let mut last = f()?;
    for _ in 1..loops {
        last = f()?;
    }
    Ok((last, start.elapsed().as_secs_f64() / f64::from(loops)))
}

fn format_time(seconds: f64, fps: bool) -> String {
    if fps {
        format!("{:.2} FPS", 1.0 / seconds)
    } else {
        format!("{seconds:.6} seconds")
    }
}

fn embed(
    common: &CommonArgs,
    psnr: f32,
    output: Option<&Path>,
    quiet: bool,
) -> Result<(), String> {
    let models = common.model.models();
    if output.is_some() && models.len() > 1 {
        return Err("--output requires a single --model".to_string());
    }
    if let Some(path) = output.filter(|p| !is_supported_image(p)) {
        return Err(format!("Unsupported output format: {}", path.display()));
    }
    let engine = build_engine(common, psnr)?;

    for &model in models {
        let (marked, secs) = timed(common.loops, || engine.embed(model))
            .map_err(|e| format!("{model} embedding failed: {e}"))?;
        let path = output.map_or_else(
            || suffixed_output_path(&common.image, model.output_suffix()),
            Path::to_path_buf,
        );
        save_luma(&marked, &path).map_err(|e| format!("Failed to save: {e}"))?;

        if !quiet {
            let achieved = masked_watermark::embedding::psnr(engine.image(), &marked);
            eprintln!(
                "[OK] {model} -> {} (PSNR {achieved:.2} dB, {})",
                path.display(),
                format_time(secs, common.fps)
            );
        }
    }
    Ok(())
}

fn detect(common: &CommonArgs, threshold: f32, quiet: bool) -> Result<(), String> {
    let engine = build_engine(common, WatermarkConfig::default().psnr)?;

    for &model in common.model.models() {
        let (result, secs) = timed(common.loops, || {
            engine.verify(engine.image(), model, threshold)
        })
        .map_err(|e| format!("{model} detection failed: {e}"))?;

        println!("Correlation [{model}]: {:.16}", result.correlation);
        if !quiet {
            let verdict = if result.detected { "present" } else { "absent" };
            eprintln!(
                "[{model}] watermark {verdict} (threshold {threshold}, {})",
                format_time(secs, common.fps)
            );
        }
    }
    Ok(())
}
