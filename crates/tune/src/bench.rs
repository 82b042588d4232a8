//! Latency measurement through a captured launch graph.

use std::sync::Arc;
use std::time::Instant;

use fused_moe_core::graph::LaunchGraph;
use fused_moe_core::moe::fused::{fused_moe_fp8_gemm, CompiledKernel, Fp8GemmParams};

use crate::config::TimingConfig;
use crate::error::Result;
use crate::inputs::SyntheticInputs;

/// Result of timing one launch configuration.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub kernel: Arc<CompiledKernel>,
    /// Mean time of one graph replay (all captured launches), microseconds.
    pub latency_us: f64,
}

/// Time `params` on `inputs`.
///
/// One untimed launch compiles the kernel. Then `capture_launches` launches
/// are recorded, replayed `warmup_iters` times, and `timed_iters` replays are
/// each bracketed by a device synchronization.
pub fn measure(
    inputs: &SyntheticInputs,
    params: &Fp8GemmParams,
    timing: &TimingConfig,
) -> Result<Measurement> {
    let device = inputs.a.device().clone();
    let gemm_inputs = inputs.as_gemm_inputs();
    let params = *params;

    let (_, kernel) = fused_moe_fp8_gemm(&gemm_inputs, &params)?;
    device.synchronize()?;

    let mut graph = LaunchGraph::capture(&device, timing.capture_launches, move || {
        fused_moe_fp8_gemm(&gemm_inputs, &params).map(|_| ())
    })?;
    device.synchronize()?;

    for _ in 0..timing.warmup_iters {
        graph.replay()?;
    }
    device.synchronize()?;

    let mut total_us = 0.0;
    for _ in 0..timing.timed_iters {
        device.synchronize()?;
        let start = Instant::now();
        graph.replay()?;
        device.synchronize()?;
        total_us += start.elapsed().as_secs_f64() * 1e6;
    }
    let latency_us = total_us / timing.timed_iters.max(1) as f64;

    tracing::debug!(
        kernel = %kernel.name,
        num_warps = kernel.launch_options().num_warps,
        num_stages = kernel.launch_options().num_stages,
        latency_us,
        "measured launch configuration"
    );

    Ok(Measurement { kernel, latency_us })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::ProblemShape;
    use candle_core::Device;
    use fused_moe_core::moe::fused::{
        ComputeType, FusedMoEBlockConfig, LaunchOptions, QuantGroupSize,
    };

    #[test]
    fn test_measure_small_problem() {
        let shape = ProblemShape {
            m: 4,
            k: 128,
            n: 32,
            num_experts: 2,
            top_k: 1,
            block_size_m: 16,
            group_size: QuantGroupSize::G128,
            compute_type: ComputeType::BF16,
        };
        let inputs = SyntheticInputs::generate(&shape, 0, &Device::Cpu).unwrap();
        let params = Fp8GemmParams {
            block: FusedMoEBlockConfig::new(16, 32, 64, 1),
            group_size: QuantGroupSize::G128,
            mul_routed_weight: true,
            top_k: 1,
            compute_type: ComputeType::BF16,
            launch: Some(LaunchOptions::new(4, 2)),
        };
        let timing = TimingConfig {
            capture_launches: 2,
            warmup_iters: 1,
            timed_iters: 3,
        };

        let m = measure(&inputs, &params, &timing).unwrap();
        assert!(m.latency_us > 0.0);
        assert_eq!(m.kernel.launch, Some(LaunchOptions::new(4, 2)));
    }
}
