//! FP8 E4M3 codec and block-quantization helpers.
//!
//! Bytes follow the `float8_e4m3fn` layout: 1 sign bit, 4 exponent bits
//! (bias 7), 3 mantissa bits, no infinities. `0x7F`/`0xFF` are NaN and the
//! largest finite magnitude is 448.
//!
//! Activations are quantized per token in groups of [`ACTIVATION_GROUP_SIZE`]
//! columns; weights per output channel in groups of a configurable size.

use std::sync::OnceLock;

use candle_core::{DType, Result, Tensor};

/// Largest finite E4M3 magnitude.
pub const FP8_E4M3_MAX: f32 = 448.0;

/// Column group covered by one activation scale.
pub const ACTIVATION_GROUP_SIZE: usize = 128;

const FP8_E4M3_MAX_BITS: u8 = 0x7E;
const FP8_E4M3_NAN_BITS: u8 = 0x7F;

/// Smallest positive normal value, 2^-6.
const MIN_NORMAL: f32 = 0.015_625;

/// Minimum scale used when a group is entirely zero.
const MIN_SCALE: f32 = 1e-10;

fn decode_bits(bits: u8) -> f32 {
    let sign = if bits & 0x80 != 0 { -1.0f32 } else { 1.0 };
    let exp = ((bits >> 3) & 0x0F) as i32;
    let mant = (bits & 0x07) as f32;

    if exp == 0x0F && bits & 0x07 == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        // Subnormal: mant/8 * 2^-6
        return sign * mant * (1.0 / 512.0);
    }
    sign * (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
}

/// Lookup table over all 256 bit patterns.
pub fn fp8_e4m3_table() -> &'static [f32; 256] {
    static TABLE: OnceLock<[f32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0f32; 256];
        for (bits, slot) in table.iter_mut().enumerate() {
            *slot = decode_bits(bits as u8);
        }
        table
    })
}

/// Decode one E4M3 byte.
#[inline]
pub fn fp8_e4m3_to_f32(bits: u8) -> f32 {
    fp8_e4m3_table()[bits as usize]
}

/// Encode an `f32` as E4M3 with round-to-nearest-even.
///
/// Magnitudes beyond 448 saturate to ±448 and NaN maps to `0x7F`.
pub fn f32_to_fp8_e4m3(val: f32) -> u8 {
    if val.is_nan() {
        return FP8_E4M3_NAN_BITS;
    }
    let sign = if val.is_sign_negative() { 0x80u8 } else { 0 };
    let abs = val.abs();

    if abs >= FP8_E4M3_MAX {
        return sign | FP8_E4M3_MAX_BITS;
    }

    if abs < MIN_NORMAL {
        // Subnormal grid step is 2^-9; a carry into 8 lands on the smallest normal.
        let m = (abs * 512.0).round_ties_even() as u8;
        return sign | m;
    }

    let mut exp = ((abs.to_bits() >> 23) & 0xFF) as i32 - 127;
    let frac = abs / 2f32.powi(exp) - 1.0;
    let mut mant = (frac * 8.0).round_ties_even() as u32;
    if mant == 8 {
        mant = 0;
        exp += 1;
    }
    if exp > 8 || (exp == 8 && mant == 7) {
        return sign | FP8_E4M3_MAX_BITS;
    }

    sign | (((exp + 7) as u8) << 3) | mant as u8
}

/// Quantize a run of values against one scale.
fn quantize_group(values: &[f32], out: &mut [u8]) -> f32 {
    let amax = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let scale = (amax / FP8_E4M3_MAX).max(MIN_SCALE);
    let inv = 1.0 / scale;
    for (dst, &v) in out.iter_mut().zip(values) {
        *dst = f32_to_fp8_e4m3(v * inv);
    }
    scale
}

/// Dynamic per-token group quantization of activations.
///
/// # Arguments
/// * `input` - Activations `[num_tokens, K]`, any float dtype
///
/// # Returns
/// Tuple of (quantized `[num_tokens, K]` in U8, scales
/// `[num_tokens, ceil(K / 128)]` in F32)
pub fn quantize_fp8_per_token_group(input: &Tensor) -> Result<(Tensor, Tensor)> {
    let (num_tokens, k) = input.dims2()?;
    let data: Vec<f32> = input.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let groups = k.div_ceil(ACTIVATION_GROUP_SIZE);

    let mut quantized = vec![0u8; num_tokens * k];
    let mut scales = Vec::with_capacity(num_tokens * groups);
    for row in 0..num_tokens {
        let base = row * k;
        for g in 0..groups {
            let start = base + g * ACTIVATION_GROUP_SIZE;
            let end = (start + ACTIVATION_GROUP_SIZE).min(base + k);
            scales.push(quantize_group(&data[start..end], &mut quantized[start..end]));
        }
    }

    let device = input.device();
    Ok((
        Tensor::from_vec(quantized, (num_tokens, k), device)?,
        Tensor::from_vec(scales, (num_tokens, groups), device)?,
    ))
}

/// Per-channel group quantization of expert weights.
///
/// # Arguments
/// * `weights` - `[num_experts, N, K]`, any float dtype
/// * `group_size` - Columns per scale
///
/// # Returns
/// Tuple of (quantized `[num_experts, N, K]` in U8, scales
/// `[num_experts, N, ceil(K / group_size)]` in F32)
pub fn quantize_fp8_per_channel_group(
    weights: &Tensor,
    group_size: usize,
) -> Result<(Tensor, Tensor)> {
    if group_size == 0 {
        candle_core::bail!("quantize_fp8_per_channel_group: group_size must be non-zero");
    }
    let (num_experts, n, k) = weights.dims3()?;
    let data: Vec<f32> = weights.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let groups = k.div_ceil(group_size);

    let mut quantized = vec![0u8; num_experts * n * k];
    let mut scales = Vec::with_capacity(num_experts * n * groups);
    for channel in 0..num_experts * n {
        let base = channel * k;
        for g in 0..groups {
            let start = base + g * group_size;
            let end = (start + group_size).min(base + k);
            scales.push(quantize_group(&data[start..end], &mut quantized[start..end]));
        }
    }

    let device = weights.device();
    Ok((
        Tensor::from_vec(quantized, (num_experts, n, k), device)?,
        Tensor::from_vec(scales, (num_experts, n, groups), device)?,
    ))
}

/// Dequantize the last dimension of an FP8 tensor with grouped scales.
///
/// `scales` has the same leading dims as `input` and one entry per
/// `group_size` columns. Groups past the stored scale count read as zero.
pub fn dequantize_fp8(input: &Tensor, scales: &Tensor, group_size: usize) -> Result<Tensor> {
    if input.dtype() != DType::U8 {
        candle_core::bail!("dequantize_fp8 expects u8 (fp8) input, got {:?}", input.dtype());
    }
    if group_size == 0 {
        candle_core::bail!("dequantize_fp8: group_size must be non-zero");
    }
    let dims = input.dims().to_vec();
    let k = *dims.last().unwrap_or(&0);
    let rows = if k == 0 { 0 } else { input.elem_count() / k };
    let groups = scales.dims().last().copied().unwrap_or(0);
    if scales.elem_count() != rows * groups {
        candle_core::bail!(
            "dequantize_fp8: scales {:?} do not match input {:?}",
            scales.dims(),
            dims
        );
    }

    let bytes: Vec<u8> = input.flatten_all()?.to_vec1()?;
    let scale_data: Vec<f32> = scales.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let table = fp8_e4m3_table();

    let mut out = Vec::with_capacity(bytes.len());
    for row in 0..rows {
        for col in 0..k {
            let g = col / group_size;
            let scale = if g < groups {
                scale_data[row * groups + g]
            } else {
                0.0
            };
            out.push(table[bytes[row * k + col] as usize] * scale);
        }
    }
    Tensor::from_vec(out, dims, input.device())
}
