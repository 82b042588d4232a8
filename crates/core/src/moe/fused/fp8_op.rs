//! Candle custom op launching the fused FP8 MoE GEMM.

use std::sync::Arc;

use candle_core::{CpuStorage, CustomOp1, Layout, Result, Shape, Storage, Tensor};
use half::{bf16, f16};

#[cfg(feature = "cuda-kernels")]
use candle_core::{cuda::CudaStorageSlice, CudaStorage};

use super::compiled::CompiledKernel;
use super::config::ComputeType;
use super::fp8_kernel::{execute, scatter, KernelArgs};
use super::schedule::LaunchGeometry;

/// Fused FP8 MoE GEMM applied to the activation tensor A.
///
/// All other operands are contiguous tensors on the same device as A:
/// `b_scale`/`a_scale`/`topk_weights` in F32, routing metadata in I64.
pub(crate) struct FusedMoeFp8Op {
    pub b: Tensor,
    pub a_scale: Tensor,
    pub b_scale: Tensor,
    pub topk_weights: Tensor,
    pub sorted_token_ids: Tensor,
    pub expert_ids: Tensor,
    pub kernel: Arc<CompiledKernel>,
    pub geom: LaunchGeometry,
    pub num_tokens_post_padded: usize,
    pub num_valid_tokens: usize,
    pub num_experts: usize,
    pub n: usize,
    pub k: usize,
    pub a_scale_groups: usize,
    pub b_scale_groups: usize,
}

impl FusedMoeFp8Op {
    fn output_shape(&self) -> Shape {
        let top_k = self.kernel.spec.top_k;
        Shape::from_dims(&[self.num_valid_tokens / top_k, top_k, self.n])
    }
}

impl CustomOp1 for FusedMoeFp8Op {
    fn name(&self) -> &'static str {
        "fused_moe_fp8"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let a = match storage {
            CpuStorage::U8(a) => &a[layout.start_offset()..],
            _ => candle_core::bail!("fused_moe_fp8 expects u8 (fp8) activations"),
        };

        let (b_guard, b_layout) = self.b.storage_and_layout();
        let b = match &*b_guard {
            Storage::Cpu(CpuStorage::U8(s)) => &s[b_layout.start_offset()..],
            _ => candle_core::bail!("fused_moe_fp8: b must be u8 on CPU"),
        };

        let (a_scale_guard, a_scale_layout) = self.a_scale.storage_and_layout();
        let a_scale = match &*a_scale_guard {
            Storage::Cpu(CpuStorage::F32(s)) => &s[a_scale_layout.start_offset()..],
            _ => candle_core::bail!("fused_moe_fp8: a_scale must be F32 on CPU"),
        };

        let (b_scale_guard, b_scale_layout) = self.b_scale.storage_and_layout();
        let b_scale = match &*b_scale_guard {
            Storage::Cpu(CpuStorage::F32(s)) => &s[b_scale_layout.start_offset()..],
            _ => candle_core::bail!("fused_moe_fp8: b_scale must be F32 on CPU"),
        };

        let (weights_guard, weights_layout) = self.topk_weights.storage_and_layout();
        let topk_weights = match &*weights_guard {
            Storage::Cpu(CpuStorage::F32(s)) => &s[weights_layout.start_offset()..],
            _ => candle_core::bail!("fused_moe_fp8: topk_weights must be F32 on CPU"),
        };

        let (sorted_guard, sorted_layout) = self.sorted_token_ids.storage_and_layout();
        let sorted_token_ids = match &*sorted_guard {
            Storage::Cpu(CpuStorage::I64(s)) => {
                let start = sorted_layout.start_offset();
                &s[start..start + sorted_layout.shape().elem_count()]
            }
            _ => candle_core::bail!("fused_moe_fp8: sorted_token_ids must be I64 on CPU"),
        };

        let (experts_guard, experts_layout) = self.expert_ids.storage_and_layout();
        let expert_ids = match &*experts_guard {
            Storage::Cpu(CpuStorage::I64(s)) => {
                let start = experts_layout.start_offset();
                &s[start..start + experts_layout.shape().elem_count()]
            }
            _ => candle_core::bail!("fused_moe_fp8: expert_ids must be I64 on CPU"),
        };

        let args = KernelArgs {
            a,
            b,
            a_scale,
            b_scale,
            topk_weights,
            sorted_token_ids,
            expert_ids,
            num_tokens_post_padded: self.num_tokens_post_padded,
            num_valid_tokens: self.num_valid_tokens,
            num_experts: self.num_experts,
            n: self.n,
            k: self.k,
            a_scale_groups: self.a_scale_groups,
            b_scale_groups: self.b_scale_groups,
        };

        let spec = &self.kernel.spec;
        let tiles = execute(&args, spec, &self.geom, &self.kernel.launch_options())?;

        let len = self.num_valid_tokens * self.n;
        let output = match spec.compute_type {
            ComputeType::F16 => {
                CpuStorage::F16(scatter(&tiles, self.n, len, f16::ZERO, f16::from_f32))
            }
            ComputeType::BF16 => {
                CpuStorage::BF16(scatter(&tiles, self.n, len, bf16::ZERO, bf16::from_f32))
            }
        };
        Ok((output, self.output_shape()))
    }

    #[cfg(feature = "cuda-kernels")]
    fn cuda_fwd(&self, storage: &CudaStorage, layout: &Layout) -> Result<(CudaStorage, Shape)> {
        use candle_core::cuda::cudarc::driver::{LaunchConfig, PushKernelArg};

        use super::compiled::FUSED_MOE_FP8_PTX;

        let dev = &storage.device;

        if layout.start_offset() != 0 {
            candle_core::bail!("fused_moe_fp8: input must be contiguous from offset 0");
        }

        let a = match &storage.slice {
            CudaStorageSlice::U8(s) => s,
            _ => candle_core::bail!("fused_moe_fp8 expects u8 (fp8) activations"),
        };

        let (b_guard, _) = self.b.storage_and_layout();
        let b = match &*b_guard {
            Storage::Cuda(cs) => match &cs.slice {
                CudaStorageSlice::U8(s) => s,
                _ => candle_core::bail!("b must be u8"),
            },
            _ => candle_core::bail!("b must be on CUDA"),
        };

        let (a_scale_guard, _) = self.a_scale.storage_and_layout();
        let a_scale = match &*a_scale_guard {
            Storage::Cuda(cs) => match &cs.slice {
                CudaStorageSlice::F32(s) => s,
                _ => candle_core::bail!("a_scale must be f32"),
            },
            _ => candle_core::bail!("a_scale must be on CUDA"),
        };

        let (b_scale_guard, _) = self.b_scale.storage_and_layout();
        let b_scale = match &*b_scale_guard {
            Storage::Cuda(cs) => match &cs.slice {
                CudaStorageSlice::F32(s) => s,
                _ => candle_core::bail!("b_scale must be f32"),
            },
            _ => candle_core::bail!("b_scale must be on CUDA"),
        };

        let (weights_guard, _) = self.topk_weights.storage_and_layout();
        let topk_weights = match &*weights_guard {
            Storage::Cuda(cs) => match &cs.slice {
                CudaStorageSlice::F32(s) => s,
                _ => candle_core::bail!("topk_weights must be f32"),
            },
            _ => candle_core::bail!("topk_weights must be on CUDA"),
        };

        let (sorted_guard, _) = self.sorted_token_ids.storage_and_layout();
        let sorted_token_ids = match &*sorted_guard {
            Storage::Cuda(cs) => match &cs.slice {
                CudaStorageSlice::I64(s) => s,
                _ => candle_core::bail!("sorted_token_ids must be i64"),
            },
            _ => candle_core::bail!("sorted_token_ids must be on CUDA"),
        };

        let (experts_guard, _) = self.expert_ids.storage_and_layout();
        let expert_ids = match &*experts_guard {
            Storage::Cuda(cs) => match &cs.slice {
                CudaStorageSlice::I64(s) => s,
                _ => candle_core::bail!("expert_ids must be i64"),
            },
            _ => candle_core::bail!("expert_ids must be on CUDA"),
        };

        let kernel = &self.kernel;
        let spec = &kernel.spec;
        let launch = kernel.launch_options();

        let func = dev.get_or_load_custom_func(
            kernel.entry_point(),
            "fused_moe_fp8",
            FUSED_MOE_FP8_PTX,
        )?;

        let cfg = LaunchConfig {
            grid_dim: (self.geom.num_programs as u32, 1, 1),
            block_dim: ((launch.num_warps * 32) as u32, 1, 1),
            shared_mem_bytes: kernel.shared_mem_bytes as u32,
        };

        let n = self.n as i32;
        let k = self.k as i32;
        let em = self.geom.em as i32;
        let num_valid_tokens = self.num_valid_tokens as i32;
        let num_tokens_post_padded = self.num_tokens_post_padded as i32;
        let sorted_len = self.sorted_token_ids.elem_count() as i32;
        let num_expert_blocks = self.expert_ids.elem_count() as i32;
        let num_experts = self.num_experts as i32;
        let a_scale_groups = self.a_scale_groups as i32;
        let b_scale_groups = self.b_scale_groups as i32;
        let top_k = spec.top_k as i32;
        let block_m = spec.block.block_size_m as i32;
        let block_n = spec.block.block_size_n as i32;
        let block_k = spec.block.block_size_k as i32;
        let group_m = spec.block.group_size_m as i32;
        let group_size = spec.group_size.as_usize() as i32;
        let mul_routed_weight = spec.mul_routed_weight as i32;
        let k_divisible = spec.k_divisible as i32;
        let num_stages = launch.num_stages as i32;

        let len = self.num_valid_tokens * self.n;

        macro_rules! launch_into {
            ($out:expr) => {{
                let mut builder = func.builder();
                builder.arg($out);
                builder.arg(a);
                builder.arg(b);
                builder.arg(a_scale);
                builder.arg(b_scale);
                builder.arg(topk_weights);
                builder.arg(sorted_token_ids);
                builder.arg(expert_ids);
                builder.arg(&n);
                builder.arg(&k);
                builder.arg(&em);
                builder.arg(&num_valid_tokens);
                builder.arg(&num_tokens_post_padded);
                builder.arg(&sorted_len);
                builder.arg(&num_expert_blocks);
                builder.arg(&num_experts);
                builder.arg(&a_scale_groups);
                builder.arg(&b_scale_groups);
                builder.arg(&top_k);
                builder.arg(&block_m);
                builder.arg(&block_n);
                builder.arg(&block_k);
                builder.arg(&group_m);
                builder.arg(&group_size);
                builder.arg(&mul_routed_weight);
                builder.arg(&k_divisible);
                builder.arg(&num_stages);
                unsafe { builder.launch(cfg) }
                    .map_err(|e| candle_core::Error::Msg(format!("fused_moe_fp8 launch: {e}")))?;
            }};
        }

        let slice = match spec.compute_type {
            ComputeType::F16 => {
                let out = dev.alloc_zeros::<f16>(len)?;
                launch_into!(&out);
                CudaStorageSlice::F16(out)
            }
            ComputeType::BF16 => {
                let out = dev.alloc_zeros::<bf16>(len)?;
                launch_into!(&out);
                CudaStorageSlice::BF16(out)
            }
        };

        drop(b_guard);
        drop(a_scale_guard);
        drop(b_scale_guard);
        drop(weights_guard);
        drop(sorted_guard);
        drop(experts_guard);

        let output_storage = CudaStorage {
            slice,
            device: dev.clone(),
        };
        Ok((output_storage, self.output_shape()))
    }
}
