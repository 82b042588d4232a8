//! Host-side wrappers for the fused MoE pipeline.
//!
//! - [`moe_align_block_size`]: group `(token, slot)` ids by expert
//! - [`fused_moe_fp8_gemm`]: validate operands, specialize, launch
//!
//! # Backends
//!
//! - **CPU**: rayon tile executor, one closure per program instance.
//! - **CUDA** (`cuda-kernels`): `kernels/fused_moe_fp8.cu`, one thread block
//!   per program instance.

use std::sync::Arc;

use candle_core::{DType, Result, Tensor};

use super::compiled::{compile_kernel, CompiledKernel};
use super::config::{
    ComputeType, FusedMoEBlockConfig, KernelSpecialization, LaunchOptions, QuantGroupSize,
};
use super::fp8_op::FusedMoeFp8Op;
use super::schedule::launch_geometry;
use super::token_grouper::MoETokenGrouper;
use crate::quantization::ACTIVATION_GROUP_SIZE;

// ============================================================================
// MoE Alignment Output
// ============================================================================

/// Output of MoE token alignment operation.
#[derive(Debug)]
pub struct MoeAlignOutput {
    /// Sorted token indices, shape [num_tokens_padded].
    /// Maps output position -> flat id (token_idx * top_k + slot).
    pub sorted_token_ids: Tensor,
    /// Expert ID for each processing block, shape [num_blocks].
    pub expert_ids: Tensor,
    /// Total number of tokens after padding to block boundaries.
    pub num_tokens_post_padded: usize,
    /// Number of valid tokens (before padding).
    pub num_valid_tokens: usize,
}

// ============================================================================
// Token Alignment
// ============================================================================

/// Align tokens by expert assignment for batched GEMM execution.
///
/// # Arguments
/// * `topk_ids` - Expert indices [num_tokens, top_k] as U32 or I64
/// * `num_experts` - Total number of experts
/// * `block_size` - Row-block size of the GEMM (`BLOCK_SIZE_M`)
pub fn moe_align_block_size(
    topk_ids: &Tensor,
    num_experts: usize,
    block_size: usize,
) -> Result<MoeAlignOutput> {
    let grouper = MoETokenGrouper::new(block_size, num_experts);
    let aligned = grouper.align_block_size(topk_ids)?;

    let num_tokens_post_padded: Vec<i64> = aligned.num_tokens_post_padded.to_vec1()?;
    let num_tokens_post_padded = num_tokens_post_padded[0];

    Ok(MoeAlignOutput {
        sorted_token_ids: aligned.sorted_token_ids,
        expert_ids: aligned.expert_ids,
        num_tokens_post_padded: num_tokens_post_padded as usize,
        num_valid_tokens: aligned.num_valid_tokens,
    })
}

// ============================================================================
// Fused FP8 GEMM
// ============================================================================

/// Operands of one fused FP8 MoE GEMM launch.
#[derive(Debug, Clone, Copy)]
pub struct Fp8MoeInputs<'a> {
    /// Activations `[num_tokens, K]`, U8 holding E4M3 bytes.
    pub a: &'a Tensor,
    /// Expert weights `[num_experts, N, K]`, U8 holding E4M3 bytes.
    pub b: &'a Tensor,
    /// `[num_tokens, ceil(K / 128)]`, F32.
    pub a_scale: &'a Tensor,
    /// `[num_experts, N, K / group_size]` (floor or ceil), F32/F16/BF16.
    pub b_scale: &'a Tensor,
    /// `[num_tokens, top_k]` routing weights.
    pub topk_weights: &'a Tensor,
    pub alignment: &'a MoeAlignOutput,
}

/// Compile-time parameters of a launch.
#[derive(Debug, Clone, Copy)]
pub struct Fp8GemmParams {
    pub block: FusedMoEBlockConfig,
    pub group_size: QuantGroupSize,
    pub mul_routed_weight: bool,
    pub top_k: usize,
    pub compute_type: ComputeType,
    /// `None` launches with [`LaunchOptions::default`].
    pub launch: Option<LaunchOptions>,
}

/// Validated problem dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProblemDims {
    num_tokens: usize,
    num_experts: usize,
    n: usize,
    k: usize,
    a_scale_groups: usize,
    b_scale_groups: usize,
}

fn check_inputs(inputs: &Fp8MoeInputs<'_>, params: &Fp8GemmParams) -> Result<ProblemDims> {
    if inputs.a.dtype() != DType::U8 || inputs.b.dtype() != DType::U8 {
        candle_core::bail!(
            "fused_moe_fp8: a and b must be u8 (fp8), got {:?} and {:?}",
            inputs.a.dtype(),
            inputs.b.dtype()
        );
    }
    let (num_tokens, k) = inputs.a.dims2()?;
    let (num_experts, n, b_k) = inputs.b.dims3()?;
    if b_k != k {
        candle_core::bail!("fused_moe_fp8: a has K={k} but b has K={b_k}");
    }
    if n == 0 || k == 0 || num_experts == 0 {
        candle_core::bail!("fused_moe_fp8: empty problem (N={n}, K={k}, experts={num_experts})");
    }

    let (a_scale_rows, a_scale_groups) = inputs.a_scale.dims2()?;
    if a_scale_rows != num_tokens
        || (a_scale_groups != k / ACTIVATION_GROUP_SIZE
            && a_scale_groups != k.div_ceil(ACTIVATION_GROUP_SIZE))
    {
        candle_core::bail!(
            "fused_moe_fp8: a_scale shape {:?}, expected [{num_tokens}, K/{ACTIVATION_GROUP_SIZE}]",
            inputs.a_scale.dims()
        );
    }

    let group_size = params.group_size.as_usize();
    let (bs_experts, bs_n, b_scale_groups) = inputs.b_scale.dims3()?;
    if bs_experts != num_experts
        || bs_n != n
        || (b_scale_groups != k / group_size && b_scale_groups != k.div_ceil(group_size))
    {
        candle_core::bail!(
            "fused_moe_fp8: b_scale shape {:?}, expected [{num_experts}, {n}, K/{group_size}]",
            inputs.b_scale.dims()
        );
    }

    let (w_rows, w_top_k) = inputs.topk_weights.dims2()?;
    if w_rows != num_tokens || w_top_k != params.top_k {
        candle_core::bail!(
            "fused_moe_fp8: topk_weights shape {:?}, expected [{num_tokens}, {}]",
            inputs.topk_weights.dims(),
            params.top_k
        );
    }

    let alignment = inputs.alignment;
    if alignment.num_valid_tokens != num_tokens * params.top_k {
        candle_core::bail!(
            "fused_moe_fp8: alignment covers {} ids, expected {num_tokens} tokens x top_k {}",
            alignment.num_valid_tokens,
            params.top_k
        );
    }
    alignment.sorted_token_ids.dims1()?;
    alignment.expert_ids.dims1()?;

    Ok(ProblemDims {
        num_tokens,
        num_experts,
        n,
        k,
        a_scale_groups,
        b_scale_groups,
    })
}

/// Fused FP8 MoE grouped GEMM.
///
/// Computes, for every valid sorted id `t = token * top_k + slot` in an
/// expert's row-block,
///
/// ```text
/// C[token, slot, n] = w[t]? * sum_k A[token, k] * a_scale[token, k / 128]
///                                 * B[e, n, k] * b_scale[e, n, k / group_size]
/// ```
///
/// Padding ids (>= `num_valid_tokens`) are masked from every load and
/// store. Rows of C that no launched row-block covers stay zero.
///
/// # Returns
/// Tuple of (C `[num_tokens, top_k, N]` in the compute dtype, the compiled
/// kernel that produced it)
pub fn fused_moe_fp8_gemm(
    inputs: &Fp8MoeInputs<'_>,
    params: &Fp8GemmParams,
) -> Result<(Tensor, Arc<CompiledKernel>)> {
    // Zero tile sizes must fail here, before they reach the launch geometry
    params.block.validate(params.group_size)?;
    let dims = check_inputs(inputs, params)?;
    let alignment = inputs.alignment;
    let device = inputs.a.device();

    let sorted_token_ids = alignment.sorted_token_ids.to_dtype(DType::I64)?.contiguous()?;
    let expert_ids = alignment.expert_ids.to_dtype(DType::I64)?.contiguous()?;

    let geom = launch_geometry(
        dims.num_tokens,
        params.top_k,
        sorted_token_ids.elem_count(),
        dims.n,
        &params.block,
    );

    let spec = KernelSpecialization {
        block: params.block,
        k_divisible: dims.k % params.block.block_size_k == 0,
        group_size: params.group_size,
        mul_routed_weight: params.mul_routed_weight,
        top_k: params.top_k,
        compute_type: params.compute_type,
    };
    let kernel = compile_kernel(&spec, params.launch, device)?;

    tracing::trace!(
        kernel = %kernel.name,
        em = geom.em,
        programs = geom.num_programs,
        num_tokens_post_padded = alignment.num_tokens_post_padded,
        "launching fused MoE FP8 GEMM"
    );

    let op = FusedMoeFp8Op {
        b: inputs.b.contiguous()?,
        a_scale: inputs.a_scale.to_dtype(DType::F32)?.contiguous()?,
        // Scales are widened once here; the kernel only reads f32
        b_scale: inputs.b_scale.to_dtype(DType::F32)?.contiguous()?,
        topk_weights: inputs
            .topk_weights
            .to_dtype(DType::F32)?
            .flatten_all()?
            .contiguous()?,
        sorted_token_ids,
        expert_ids,
        kernel: kernel.clone(),
        geom,
        num_tokens_post_padded: alignment.num_tokens_post_padded,
        num_valid_tokens: alignment.num_valid_tokens,
        num_experts: dims.num_experts,
        n: dims.n,
        k: dims.k,
        a_scale_groups: dims.a_scale_groups,
        b_scale_groups: dims.b_scale_groups,
    };

    let c = inputs.a.contiguous()?.apply_op1_no_bwd(&op)?;
    Ok((c, kernel))
}
