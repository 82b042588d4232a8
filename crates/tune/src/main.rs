use clap::Parser;

use fused_moe_tune::cli::TuneArgs;
use fused_moe_tune::logging::{self, LogFormat};
use fused_moe_tune::runner;

fn main() -> anyhow::Result<()> {
    let args = TuneArgs::parse();
    logging::init(&args.log_level, LogFormat::from_env())?;

    let report = runner::run(&args)?;
    tracing::info!(
        kernel = %report.outcome.default.kernel.name,
        image = %report.artifacts.image.display(),
        latency_us = report.selected_latency_us,
        "done"
    );
    Ok(())
}
