//! Seeded synthetic operands for benchmarking.
//!
//! Values only need to be deterministic and finite; timing does not depend
//! on them. FP8 operands are cast straight from f32 (no scaling), scales are
//! drawn independently, as a quantized checkpoint would store them.

use candle_core::{Device, Tensor};
use fused_moe_core::moe::fused::{
    moe_align_block_size, ComputeType, Fp8MoeInputs, MoeAlignOutput, QuantGroupSize,
};
use fused_moe_core::quantization::{f32_to_fp8_e4m3, ACTIVATION_GROUP_SIZE};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TuneError};

/// Problem dimensions of one harness run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub num_experts: usize,
    pub top_k: usize,
    pub block_size_m: usize,
    pub group_size: QuantGroupSize,
    pub compute_type: ComputeType,
}

impl ProblemShape {
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 || self.k == 0 || self.n == 0 || self.num_experts == 0 {
            return Err(TuneError::InvalidProblem(format!(
                "m, k, n and num_experts must be > 0, got m={} k={} n={} num_experts={}",
                self.m, self.k, self.n, self.num_experts
            )));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(TuneError::InvalidProblem(format!(
                "top_k={} must be in 1..={}",
                self.top_k, self.num_experts
            )));
        }
        Ok(())
    }

    /// Upper bound on padded sorted ids: `m * top_k + num_experts * (BLOCK_SIZE_M - 1)`.
    pub fn max_padded_tokens(&self) -> usize {
        self.m * self.top_k + self.num_experts * self.block_size_m.saturating_sub(1)
    }
}

/// Operands of one fused MoE launch, owned.
pub struct SyntheticInputs {
    pub a: Tensor,
    pub b: Tensor,
    pub a_scale: Tensor,
    pub b_scale: Tensor,
    pub topk_weights: Tensor,
    pub topk_ids: Tensor,
    pub alignment: MoeAlignOutput,
}

impl SyntheticInputs {
    /// Generate operands for `shape` on `device`.
    pub fn generate(shape: &ProblemShape, seed: u64, device: &Device) -> Result<Self> {
        shape.validate()?;
        let ProblemShape {
            m,
            k,
            n,
            num_experts,
            top_k,
            ..
        } = *shape;
        let mut rng = StdRng::seed_from_u64(seed);

        let a = fp8_values(&mut rng, m * k);
        let b = fp8_values(&mut rng, num_experts * n * k);
        let a_groups = k.div_ceil(ACTIVATION_GROUP_SIZE);
        let b_groups = k.div_ceil(shape.group_size.as_usize());
        let a_scale = uniform(&mut rng, m * a_groups, -1.0, 1.0);
        let b_scale = uniform(&mut rng, num_experts * n * b_groups, -1.0, 1.0);
        let topk_weights = uniform(&mut rng, m * top_k, 0.0, 1.0);

        let mut experts: Vec<u32> = (0..num_experts as u32).collect();
        let mut topk_ids = Vec::with_capacity(m * top_k);
        for _ in 0..m {
            let (chosen, _) = experts.partial_shuffle(&mut rng, top_k);
            topk_ids.extend_from_slice(chosen);
        }

        let topk_ids = Tensor::from_vec(topk_ids, (m, top_k), device)?;
        let alignment = moe_align_block_size(&topk_ids, num_experts, shape.block_size_m)?;

        Ok(Self {
            a: Tensor::from_vec(a, (m, k), device)?,
            b: Tensor::from_vec(b, (num_experts, n, k), device)?,
            a_scale: Tensor::from_vec(a_scale, (m, a_groups), device)?,
            // Stored in the compute dtype; the kernel wrapper widens it
            b_scale: Tensor::from_vec(b_scale, (num_experts, n, b_groups), device)?
                .to_dtype(shape.compute_type.dtype())?,
            topk_weights: Tensor::from_vec(topk_weights, (m, top_k), device)?,
            topk_ids,
            alignment,
        })
    }

    /// Borrow the operands for [`fused_moe_fp8_gemm`](fused_moe_core::moe::fused::fused_moe_fp8_gemm).
    pub fn as_gemm_inputs(&self) -> Fp8MoeInputs<'_> {
        Fp8MoeInputs {
            a: &self.a,
            b: &self.b,
            a_scale: &self.a_scale,
            b_scale: &self.b_scale,
            topk_weights: &self.topk_weights,
            alignment: &self.alignment,
        }
    }
}

fn uniform(rng: &mut StdRng, len: usize, low: f32, high: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(low..high)).collect()
}

fn fp8_values(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len)
        .map(|_| f32_to_fp8_e4m3(rng.gen_range(-2.0..2.0)))
        .collect()
}
