// convert_bge — download BGE-Small, export it to ONNX, quantize for mobile.
//
// Straight-line pipeline: fetch -> export -> quantize -> report paths. Each
// graph stage consumes the previous stage's file on disk, not an in-memory
// handle, so a failed run can be rerun from whatever it left behind.

mod config;
mod export;
mod fetch;
mod logging;
mod quantize;

fn main() {
    if let Err(e) = real_main() {
        // Keep stderr noisy for operator bug reports; the log stream has the
        // same chain via log::error.
        eprintln!("[bge-onnx-convert] fatal error: {e:?}");
        log::error!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}

fn real_main() -> anyhow::Result<()> {
    logging::init_logging()?;

    let model_dir = fetch::ensure_artifacts()?;

    let onnx_path = export::export_onnx(&model_dir)?;

    let quantized_path = model_dir.join(quantized_file_name());
    quantize::quantize_dynamic(&onnx_path, &quantized_path)?;

    // Final report: the two artifacts, quantized one recommended.
    println!();
    println!("Model files:");
    println!("  - Full precision: {}", onnx_path.display());
    println!("  - Quantized: {}", quantized_path.display());
    println!();
    println!("Recommended for mobile deployment: {}", quantized_file_name());

    log::info!("Conversion completed successfully");
    Ok(())
}

fn quantized_file_name() -> String {
    format!(
        "{}{}",
        config::model::MODEL_SHORT_NAME,
        config::quantize::QUANTIZED_SUFFIX
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantized_file_name() {
        assert_eq!(quantized_file_name(), "bge-small-en-v1.5-quantized.onnx");
    }
}
