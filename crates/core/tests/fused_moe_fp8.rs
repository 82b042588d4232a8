//! Integration tests for the fused FP8 MoE GEMM.
//!
//! Every test compares the tiled kernel against the untiled reference built
//! straight from `topk_ids`. All CPU-only unless `cuda-kernels` is enabled.

use candle_core::{DType, Device, Tensor};
use fused_moe_core::moe::fused::{
    fused_moe_fp8_gemm, fused_moe_fp8_reference, moe_align_block_size, ComputeType,
    Fp8GemmParams, Fp8MoeInputs, FusedMoEBlockConfig, LaunchOptions, MoeAlignOutput,
    QuantGroupSize,
};
use fused_moe_core::quantization::{quantize_fp8_per_channel_group, quantize_fp8_per_token_group};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

struct Problem {
    a: Tensor,
    b: Tensor,
    a_scale: Tensor,
    b_scale: Tensor,
    topk_weights: Tensor,
    topk_ids: Tensor,
    group_size: QuantGroupSize,
    top_k: usize,
}

impl Problem {
    #[allow(clippy::too_many_arguments)]
    fn random(
        m: usize,
        k: usize,
        n: usize,
        num_experts: usize,
        top_k: usize,
        group_size: QuantGroupSize,
        seed: u64,
        device: &Device,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let a: Vec<f32> = (0..m * k).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..num_experts * n * k)
            .map(|_| rng.gen_range(-0.5..0.5))
            .collect();
        let a = Tensor::from_vec(a, (m, k), device).unwrap();
        let b = Tensor::from_vec(b, (num_experts, n, k), device).unwrap();
        let (a, a_scale) = quantize_fp8_per_token_group(&a).unwrap();
        let (b, b_scale) = quantize_fp8_per_channel_group(&b, group_size.as_usize()).unwrap();

        let mut ids = Vec::with_capacity(m * top_k);
        let mut experts: Vec<u32> = (0..num_experts as u32).collect();
        for _ in 0..m {
            experts.shuffle(&mut rng);
            ids.extend_from_slice(&experts[..top_k]);
        }
        let weights: Vec<f32> = (0..m * top_k).map(|_| rng.gen_range(0.0..1.0)).collect();

        Self {
            a,
            b,
            a_scale,
            b_scale,
            topk_weights: Tensor::from_vec(weights, (m, top_k), device).unwrap(),
            topk_ids: Tensor::from_vec(ids, (m, top_k), device).unwrap(),
            group_size,
            top_k,
        }
    }

    fn align(&self, block_size_m: usize) -> MoeAlignOutput {
        let num_experts = self.b.dims()[0];
        moe_align_block_size(&self.topk_ids, num_experts, block_size_m).unwrap()
    }

    fn inputs<'a>(&'a self, alignment: &'a MoeAlignOutput) -> Fp8MoeInputs<'a> {
        Fp8MoeInputs {
            a: &self.a,
            b: &self.b,
            a_scale: &self.a_scale,
            b_scale: &self.b_scale,
            topk_weights: &self.topk_weights,
            alignment,
        }
    }

    fn params(&self, block: FusedMoEBlockConfig, mul_routed_weight: bool) -> Fp8GemmParams {
        Fp8GemmParams {
            block,
            group_size: self.group_size,
            mul_routed_weight,
            top_k: self.top_k,
            compute_type: ComputeType::BF16,
            launch: None,
        }
    }

    fn reference(&self, mul_routed_weight: bool) -> Vec<f32> {
        flat(
            &fused_moe_fp8_reference(
                &self.a,
                &self.b,
                &self.a_scale,
                &self.b_scale,
                &self.topk_weights,
                &self.topk_ids,
                self.group_size,
                mul_routed_weight,
            )
            .unwrap(),
        )
    }

    fn run(&self, block: FusedMoEBlockConfig, mul_routed_weight: bool) -> Vec<f32> {
        let alignment = self.align(block.block_size_m);
        let (c, _) = fused_moe_fp8_gemm(
            &self.inputs(&alignment),
            &self.params(block, mul_routed_weight),
        )
        .unwrap();
        flat(&c)
    }
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    let scale = expected.iter().fold(0f32, |m, v| m.max(v.abs())).max(1e-6);
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tol = 1e-2 * e.abs() + 1e-3 * scale;
        assert!((a - e).abs() <= tol, "index {i}: got {a}, expected {e}");
    }
}

// ─── Correctness against the reference ──────────────────────────────────────

#[test]
fn test_matches_reference_small_problem() {
    // m=4, k=256, n=128, 2 experts, top_k=1, group 128, BLOCK_SIZE_K=64
    let p = Problem::random(4, 256, 128, 2, 1, QuantGroupSize::G128, 0, &Device::Cpu);
    let block = FusedMoEBlockConfig::new(16, 32, 64, 1);
    assert_close(&p.run(block, false), &p.reference(false));
}

#[test]
fn test_matches_reference_with_routing_weights_and_top_k() {
    let p = Problem::random(37, 128, 50, 4, 2, QuantGroupSize::G64, 1, &Device::Cpu);
    let block = FusedMoEBlockConfig::new(16, 32, 32, 4);
    assert_close(&p.run(block, true), &p.reference(true));
    assert_close(&p.run(block, false), &p.reference(false));
}

#[test]
fn test_matches_reference_non_divisible_k() {
    // 144 = 4 * 32 + 16: the last chunk is masked; b_scale carries a partial group
    let p = Problem::random(9, 144, 40, 3, 2, QuantGroupSize::G64, 2, &Device::Cpu);
    assert_eq!(p.b_scale.dims(), &[3, 40, 3]);
    let block = FusedMoEBlockConfig::new(16, 16, 32, 2);
    assert_close(&p.run(block, true), &p.reference(true));
}

#[test]
fn test_floor_shaped_weight_scales_drop_the_tail() {
    // With K/group_size floored the trailing 16 columns have no scale
    let mut p = Problem::random(5, 144, 24, 2, 1, QuantGroupSize::G64, 3, &Device::Cpu);
    p.b_scale = p.b_scale.narrow(2, 0, 2).unwrap().contiguous().unwrap();
    let block = FusedMoEBlockConfig::new(16, 16, 16, 1);
    assert_close(&p.run(block, false), &p.reference(false));
}

#[test]
fn test_floor_shaped_activation_scales_drop_the_tail() {
    // K = 200 with K/128 floored: columns 128.. have no activation scale
    let mut p = Problem::random(4, 200, 24, 2, 1, QuantGroupSize::G64, 11, &Device::Cpu);
    p.a_scale = p.a_scale.narrow(1, 0, 1).unwrap().contiguous().unwrap();
    let block = FusedMoEBlockConfig::new(16, 16, 8, 1);
    let out = p.run(block, false);
    assert!(out.iter().any(|v| *v != 0.0));
    assert_close(&out, &p.reference(false));
}

#[test]
fn test_small_batch_caps_launch_rows() {
    // 2 tokens over 8 experts: sorted ids hold 4 + 8 * 15 slots, EM is capped at 64
    let p = Problem::random(2, 128, 64, 8, 2, QuantGroupSize::G128, 4, &Device::Cpu);
    let block = FusedMoEBlockConfig::new(16, 32, 64, 1);
    assert_close(&p.run(block, true), &p.reference(true));
}

#[test]
fn test_f16_and_bf16_outputs_agree_with_reference() {
    let p = Problem::random(6, 128, 32, 2, 1, QuantGroupSize::G128, 5, &Device::Cpu);
    let block = FusedMoEBlockConfig::new(16, 16, 64, 1);
    let alignment = p.align(16);
    let reference = p.reference(false);

    for compute_type in [ComputeType::F16, ComputeType::BF16] {
        let mut params = p.params(block, false);
        params.compute_type = compute_type;
        let (c, kernel) = fused_moe_fp8_gemm(&p.inputs(&alignment), &params).unwrap();
        assert_eq!(c.dtype(), compute_type.dtype());
        assert_eq!(kernel.spec.compute_type, compute_type);
        assert_close(&flat(&c), &reference);
    }
}

// ─── Scheduling invariance ──────────────────────────────────────────────────

#[test]
fn test_group_size_m_does_not_change_results() {
    let p = Problem::random(40, 128, 96, 4, 2, QuantGroupSize::G64, 6, &Device::Cpu);
    let baseline = p.run(FusedMoEBlockConfig::new(16, 32, 32, 1), true);
    for group_size_m in [2, 3, 8, 64] {
        let out = p.run(FusedMoEBlockConfig::new(16, 32, 32, group_size_m), true);
        assert_eq!(out, baseline, "GROUP_SIZE_M={group_size_m}");
    }
}

#[test]
fn test_launch_options_do_not_change_results() {
    let p = Problem::random(20, 128, 48, 3, 2, QuantGroupSize::G128, 7, &Device::Cpu);
    let block = FusedMoEBlockConfig::new(16, 16, 64, 2);
    let alignment = p.align(16);
    let baseline = {
        let (c, _) = fused_moe_fp8_gemm(&p.inputs(&alignment), &p.params(block, true)).unwrap();
        flat(&c)
    };
    for num_warps in [4, 8] {
        for num_stages in [2, 3, 4, 5] {
            let mut params = p.params(block, true);
            params.launch = Some(LaunchOptions::new(num_warps, num_stages));
            let (c, kernel) = fused_moe_fp8_gemm(&p.inputs(&alignment), &params).unwrap();
            assert_eq!(kernel.launch_options(), LaunchOptions::new(num_warps, num_stages));
            assert_eq!(flat(&c), baseline, "warps={num_warps} stages={num_stages}");
        }
    }
}

#[test]
fn test_low_precision_weight_scales_match_widened_scales() {
    let mut p = Problem::random(8, 128, 32, 2, 1, QuantGroupSize::G128, 8, &Device::Cpu);
    p.b_scale = p.b_scale.to_dtype(DType::BF16).unwrap();
    let block = FusedMoEBlockConfig::new(16, 16, 64, 1);
    let alignment = p.align(16);

    let (low, _) = fused_moe_fp8_gemm(&p.inputs(&alignment), &p.params(block, false)).unwrap();

    let widened = p.b_scale.to_dtype(DType::F32).unwrap();
    let mut inputs = p.inputs(&alignment);
    inputs.b_scale = &widened;
    let (wide, _) = fused_moe_fp8_gemm(&inputs, &p.params(block, false)).unwrap();

    assert_eq!(flat(&low), flat(&wide));
    assert_close(&flat(&low), &p.reference(false));
}

// ─── Padding, early exit and unused blocks ──────────────────────────────────

/// 8 tokens, tokens 0..4 on expert 0 and 4..8 on expert 1, BLOCK_SIZE_M=4.
fn two_block_problem() -> Problem {
    let mut p = Problem::random(8, 128, 16, 2, 1, QuantGroupSize::G128, 9, &Device::Cpu);
    p.topk_ids = Tensor::new(&[[0u32], [0], [0], [0], [1], [1], [1], [1]], &Device::Cpu).unwrap();
    p
}

#[test]
fn test_blocks_past_post_padded_exit_early() {
    let p = two_block_problem();
    let block = FusedMoEBlockConfig::new(4, 16, 64, 1);
    let mut alignment = p.align(4);
    assert_eq!(alignment.num_tokens_post_padded, 8);
    alignment.num_tokens_post_padded = 4;

    let (c, _) = fused_moe_fp8_gemm(&p.inputs(&alignment), &p.params(block, false)).unwrap();
    let out = flat(&c);
    let reference = p.reference(false);

    assert_close(&out[..4 * 16], &reference[..4 * 16]);
    assert!(out[4 * 16..].iter().all(|&v| v == 0.0));
}

#[test]
fn test_unused_expert_block_writes_zeros() {
    let p = two_block_problem();
    let block = FusedMoEBlockConfig::new(4, 16, 64, 1);
    let mut alignment = p.align(4);
    let mut experts: Vec<i64> = alignment.expert_ids.to_vec1().unwrap();
    experts[0] = -1;
    alignment.expert_ids = Tensor::new(experts.as_slice(), &Device::Cpu).unwrap();

    let (c, _) = fused_moe_fp8_gemm(&p.inputs(&alignment), &p.params(block, false)).unwrap();
    let out = flat(&c);
    let reference = p.reference(false);

    assert!(out[..4 * 16].iter().all(|&v| v == 0.0));
    assert_close(&out[4 * 16..], &reference[4 * 16..]);
}

#[test]
fn test_padding_ids_never_reach_output() {
    // Expert 0 gets 3 ids padded to 4; the sentinel must not alias token 3's row
    let mut p = Problem::random(4, 128, 16, 2, 1, QuantGroupSize::G128, 10, &Device::Cpu);
    p.topk_ids = Tensor::new(&[[0u32], [0], [0], [1]], &Device::Cpu).unwrap();
    let block = FusedMoEBlockConfig::new(4, 16, 64, 1);
    let alignment = p.align(4);
    let sorted: Vec<i64> = alignment.sorted_token_ids.to_vec1().unwrap();
    assert_eq!(&sorted[..8], &[0, 1, 2, 4, 3, 4, 4, 4]);

    let (c, _) = fused_moe_fp8_gemm(&p.inputs(&alignment), &p.params(block, false)).unwrap();
    assert_close(&flat(&c), &p.reference(false));
}

#[test]
fn test_u32_alignment_tensors_are_accepted() {
    let p = two_block_problem();
    let block = FusedMoEBlockConfig::new(4, 16, 64, 1);
    let aligned = p.align(4);
    let alignment = MoeAlignOutput {
        sorted_token_ids: aligned.sorted_token_ids.to_dtype(DType::U32).unwrap(),
        expert_ids: Tensor::new(&[0u32, 1], &Device::Cpu).unwrap(),
        num_tokens_post_padded: aligned.num_tokens_post_padded,
        num_valid_tokens: aligned.num_valid_tokens,
    };
    let (c, _) = fused_moe_fp8_gemm(&p.inputs(&alignment), &p.params(block, false)).unwrap();
    assert_close(&flat(&c), &p.reference(false));
}

// ─── CUDA ───────────────────────────────────────────────────────────────────

#[cfg(feature = "cuda-kernels")]
mod gpu_tests {
    use super::*;

    fn get_cuda_device() -> Option<Device> {
        Device::cuda_if_available(0).ok().filter(|d| d.is_cuda())
    }

    #[test]
    fn test_cuda_matches_reference() {
        let Some(device) = get_cuda_device() else {
            eprintln!("Skipping test: no CUDA device");
            return;
        };
        let p = Problem::random(37, 144, 50, 4, 2, QuantGroupSize::G64, 11, &device);
        let block = FusedMoEBlockConfig::new(16, 32, 32, 4);
        assert_close(&p.run(block, true), &p.reference(true));
    }

    #[test]
    fn test_cuda_launch_options_do_not_change_results() {
        let Some(device) = get_cuda_device() else {
            eprintln!("Skipping test: no CUDA device");
            return;
        };
        let p = Problem::random(20, 128, 48, 3, 2, QuantGroupSize::G128, 12, &device);
        let block = FusedMoEBlockConfig::new(16, 16, 64, 2);
        let alignment = p.align(16);
        let mut results = Vec::new();
        for num_warps in [4, 8] {
            for num_stages in [2, 3, 4, 5] {
                let mut params = p.params(block, true);
                params.launch = Some(LaunchOptions::new(num_warps, num_stages));
                let (c, _) = fused_moe_fp8_gemm(&p.inputs(&alignment), &params).unwrap();
                results.push(flat(&c));
            }
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}
