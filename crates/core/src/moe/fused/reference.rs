//! Untiled reference for the fused FP8 MoE GEMM.
//!
//! Works straight from `topk_ids` without any alignment or tiling, so it can
//! check the tiled kernel end to end.

use candle_core::{DType, Result, Tensor};

use super::config::QuantGroupSize;
use crate::quantization::{fp8_e4m3_table, ACTIVATION_GROUP_SIZE};

/// Dequantize-then-multiply reference, F32 output `[num_tokens, top_k, N]`.
///
/// Scale groups past the stored count read as zero, matching the kernel.
#[allow(clippy::too_many_arguments)]
pub fn fused_moe_fp8_reference(
    a: &Tensor,
    b: &Tensor,
    a_scale: &Tensor,
    b_scale: &Tensor,
    topk_weights: &Tensor,
    topk_ids: &Tensor,
    group_size: QuantGroupSize,
    mul_routed_weight: bool,
) -> Result<Tensor> {
    let (num_tokens, k) = a.dims2()?;
    let (num_experts, n, _) = b.dims3()?;
    let (_, top_k) = topk_ids.dims2()?;
    let a_groups = a_scale.dims2()?.1;
    let b_groups = b_scale.dims3()?.2;
    let group_size = group_size.as_usize();

    let a_bytes: Vec<u8> = a.flatten_all()?.to_vec1()?;
    let b_bytes: Vec<u8> = b.flatten_all()?.to_vec1()?;
    let a_scale: Vec<f32> = a_scale.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let b_scale: Vec<f32> = b_scale.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let weights: Vec<f32> = topk_weights.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let ids: Vec<i64> = topk_ids.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
    let table = fp8_e4m3_table();

    let a_at = |t: usize, kk: usize| -> f64 {
        let g = kk / ACTIVATION_GROUP_SIZE;
        let s = if g < a_groups { a_scale[t * a_groups + g] } else { 0.0 };
        table[a_bytes[t * k + kk] as usize] as f64 * s as f64
    };
    let b_at = |e: usize, col: usize, kk: usize| -> f64 {
        let g = kk / group_size;
        let channel = e * n + col;
        let s = if g < b_groups { b_scale[channel * b_groups + g] } else { 0.0 };
        table[b_bytes[channel * k + kk] as usize] as f64 * s as f64
    };

    let mut out = vec![0f32; num_tokens * top_k * n];
    for t in 0..num_tokens {
        for slot in 0..top_k {
            let flat = t * top_k + slot;
            let e = ids[flat];
            if e < 0 || e as usize >= num_experts {
                candle_core::bail!("reference: expert id {e} out of range");
            }
            let e = e as usize;
            let w = if mul_routed_weight { weights[flat] as f64 } else { 1.0 };
            for col in 0..n {
                let acc: f64 = (0..k).map(|kk| a_at(t, kk) * b_at(e, col, kk)).sum();
                out[flat * n + col] = (acc * w) as f32;
            }
        }
    }
    Tensor::from_vec(out, (num_tokens, top_k, n), a.device())
}
