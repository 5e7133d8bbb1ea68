use anyhow::Context;
use flexi_logger::Logger;

use crate::config;

pub fn init_logging() -> anyhow::Result<()> {
    // One-shot conversion tool: progress messages go to stdout, no log file.
    Logger::try_with_str("info")?
        .log_to_stdout()
        .format(flexi_logger::detailed_format)
        .start()
        .context("failed to start logger")?;

    log::info!("{}", "=".repeat(60));
    log::info!("BGE-Small ONNX converter starting");
    log::info!("Version: {}", config::TOOL_VERSION);
    log::info!("Platform: {}", std::env::consts::OS);
    log::info!("{}", "=".repeat(60));

    Ok(())
}
