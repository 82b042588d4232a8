//! Launch-option sweep and selection.

use fused_moe_core::moe::fused::{Fp8GemmParams, LaunchOptions};

use crate::bench::{measure, Measurement};
use crate::config::SweepConfig;
use crate::error::Result;
use crate::inputs::SyntheticInputs;

/// A swept launch configuration and its timing.
#[derive(Debug, Clone)]
pub struct Trial {
    pub launch: LaunchOptions,
    pub measurement: Measurement,
}

/// Everything the sweep measured.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// Kernel compiled without explicit launch options.
    pub default: Measurement,
    /// Candidates that compiled and ran, in sweep order.
    pub trials: Vec<Trial>,
}

impl SweepOutcome {
    /// Fastest trial, if it is not slower than the default.
    pub fn best(&self) -> Option<&Trial> {
        let latencies: Vec<f64> = self
            .trials
            .iter()
            .map(|t| t.measurement.latency_us)
            .collect();
        select_best(self.default.latency_us, &latencies).map(|i| &self.trials[i])
    }
}

/// Index of the fastest latency, the earliest on ties. `None` when there are
/// no latencies or the fastest is slower than `default_us`.
pub fn select_best(default_us: f64, latencies: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &latency) in latencies.iter().enumerate() {
        match best {
            Some((_, b)) if latency >= b => {}
            _ => best = Some((i, latency)),
        }
    }
    best.filter(|&(_, latency)| latency <= default_us)
        .map(|(i, _)| i)
}

/// Time the default configuration and every candidate of `sweep`.
///
/// Candidates that fail to compile or launch are skipped with a warning;
/// a failing default is an error.
pub fn run_sweep(
    inputs: &SyntheticInputs,
    params: &Fp8GemmParams,
    sweep: &SweepConfig,
) -> Result<SweepOutcome> {
    let timing = sweep.timing();

    let default = measure(
        inputs,
        &Fp8GemmParams {
            launch: None,
            ..*params
        },
        &timing,
    )?;

    let mut trials = Vec::new();
    for launch in sweep.candidates() {
        let candidate = Fp8GemmParams {
            launch: Some(launch),
            ..*params
        };
        match measure(inputs, &candidate, &timing) {
            Ok(measurement) => trials.push(Trial {
                launch,
                measurement,
            }),
            Err(e) => {
                tracing::warn!(
                    num_warps = launch.num_warps,
                    num_stages = launch.num_stages,
                    error = %e,
                    "skipping launch configuration"
                );
            }
        }
    }

    Ok(SweepOutcome { default, trials })
}
