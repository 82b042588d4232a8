//! One harness run: generate inputs, sweep, select, dump.

use fused_moe_core::moe::fused::LaunchOptions;

use crate::artifact::{dump_kernel, ArtifactPaths};
use crate::cli::TuneArgs;
use crate::config::SweepConfig;
use crate::error::Result;
use crate::inputs::SyntheticInputs;
use crate::search::{run_sweep, SweepOutcome};

/// What a run measured and wrote.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: SweepOutcome,
    /// Launch options of the dumped kernel; `None` for the default.
    pub selected: Option<LaunchOptions>,
    pub selected_latency_us: f64,
    pub artifacts: ArtifactPaths,
}

/// Run the harness for `args`.
///
/// The default kernel is always dumped first. With `--tune`, a swept
/// configuration that is not slower than the default overwrites it.
pub fn run(args: &TuneArgs) -> Result<RunReport> {
    let sweep = match &args.sweep_config {
        Some(path) => SweepConfig::load_from(path)?,
        None => SweepConfig::default(),
    };
    let device = args.device()?;
    let shape = args.problem_shape();
    let inputs = SyntheticInputs::generate(&shape, args.seed, &device)?;

    tracing::info!(
        m = shape.m,
        k = shape.k,
        n = shape.n,
        num_experts = shape.num_experts,
        top_k = shape.top_k,
        max_padded_tokens = shape.max_padded_tokens(),
        num_tokens_post_padded = inputs.alignment.num_tokens_post_padded,
        device = ?args.device,
        "generated synthetic inputs"
    );

    let outcome = run_sweep(&inputs, &args.gemm_params(None), &sweep)?;
    let default_us = outcome.default.latency_us;
    let mut artifacts = dump_kernel(&outcome.default.kernel, &args.output_dir)?;

    let (selected, selected_latency_us) = match outcome.best() {
        Some(best) if args.tune => {
            artifacts = dump_kernel(&best.measurement.kernel, &args.output_dir)?;
            tracing::info!("Found best config after tuning");
            tracing::info!(
                block = ?args.block_config(),
                num_warps = best.launch.num_warps,
                num_stages = best.launch.num_stages,
                "tuned config"
            );
            tracing::info!(
                "Tuned best config average latency: {} us",
                best.measurement.latency_us
            );
            tracing::info!("Default config average latency: {default_us} us");
            (Some(best.launch), best.measurement.latency_us)
        }
        _ => {
            tracing::info!("Using default config");
            tracing::info!(block = ?args.block_config(), "default config");
            tracing::info!("Average latency: {default_us} us");
            (None, default_us)
        }
    };

    Ok(RunReport {
        outcome,
        selected,
        selected_latency_us,
        artifacts,
    })
}
