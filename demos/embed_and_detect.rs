//! Watermark a single image with both mask models and report the correlations.
//!
//! Usage:
//! ```sh
//! cargo run --example embed_and_detect -- input.png [seed]
//! ```

use std::env;
use std::path::Path;
use std::process;

use masked_watermark::{
    load_luma, save_luma, suffixed_output_path, MaskModel, ReferencePattern, WatermarkConfig,
    WatermarkEngine,
};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <input> [seed]", args[0]);
        process::exit(1);
    }

    let input = Path::new(&args[1]);
    let seed = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(42);

    let image = load_luma(input).expect("failed to load image");
    let pattern = ReferencePattern::generate(image.width(), image.height(), seed);
    let engine = WatermarkEngine::new(image, pattern, WatermarkConfig::default())
        .expect("failed to initialize engine");

    for model in [MaskModel::Nvf, MaskModel::PredictionError] {
        let marked = engine.embed(model).expect("embedding failed");
        let marked_score = engine.detect(&marked, model).expect("detection failed");
        let original_score = engine
            .detect(engine.image(), model)
            .expect("detection failed");

        let output = suffixed_output_path(input, model.output_suffix());
        save_luma(&marked, &output).expect("failed to save image");

        println!(
            "{model}: watermarked {marked_score:.4}, original {original_score:.4} -> {}",
            output.display()
        );
    }
}
