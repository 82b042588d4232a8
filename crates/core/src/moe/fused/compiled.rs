//! Compiled kernel specializations and their serialized form.
//!
//! A [`CompiledKernel`] is what gets launched and what the tuning harness
//! dumps: a binary image, a human-readable listing and the shared-memory
//! footprint. On CUDA the image is the PTX module built from
//! `kernels/fused_moe_fp8.cu`; on CPU it is a compact encoding of the
//! specialization that [`KernelSpecialization::decode`] restores.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, OnceLock};

use candle_core::{Device, Result};

use super::config::{
    ComputeType, FusedMoEBlockConfig, KernelSpecialization, LaunchOptions, QuantGroupSize,
};
use crate::quantization::ACTIVATION_GROUP_SIZE;

/// PTX for the fused FP8 MoE GEMM (compiled from fused_moe_fp8.cu)
#[cfg(feature = "cuda-kernels")]
pub(crate) const FUSED_MOE_FP8_PTX: &str = include_str!("../../../kernels/fused_moe_fp8.ptx");

/// Per-thread accumulator slots in the CUDA kernel.
pub const MAX_ACC_PER_THREAD: usize = 128;

/// Static shared memory available to one CUDA block without opt-in.
pub const MAX_SHARED_MEM_BYTES: usize = 48 * 1024;

const IMAGE_MAGIC: &[u8; 4] = b"FMOE";
const IMAGE_VERSION: u32 = 1;
const IMAGE_FIELDS: usize = 9;
const IMAGE_LEN: usize = 8 + 4 * IMAGE_FIELDS;

/// Where a kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelBackend {
    Cpu,
    Cuda,
}

impl KernelBackend {
    pub fn for_device(device: &Device) -> Result<Self> {
        match device {
            Device::Cpu => Ok(Self::Cpu),
            #[cfg(feature = "cuda-kernels")]
            Device::Cuda(_) => Ok(Self::Cuda),
            _ => candle_core::bail!("fused_moe_fp8: unsupported device {device:?}"),
        }
    }
}

/// A specialized kernel ready to launch.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub name: String,
    pub backend: KernelBackend,
    pub spec: KernelSpecialization,
    /// Explicit launch options; `None` means the defaults.
    pub launch: Option<LaunchOptions>,
    pub image: Vec<u8>,
    pub asm: String,
    pub shared_mem_bytes: usize,
}

impl CompiledKernel {
    /// Launch options in effect.
    pub fn launch_options(&self) -> LaunchOptions {
        self.launch.unwrap_or_default()
    }

    /// Symbol the kernel is launched through. On CUDA this is the entry
    /// point inside the PTX module.
    pub fn entry_point(&self) -> &'static str {
        match (self.backend, self.spec.compute_type) {
            (KernelBackend::Cpu, _) => "fused_moe_fp8_cpu",
            (KernelBackend::Cuda, ComputeType::F16) => "fused_moe_fp8_gemm_f16",
            (KernelBackend::Cuda, ComputeType::BF16) => "fused_moe_fp8_gemm_bf16",
        }
    }
}

impl KernelSpecialization {
    /// Serialize as `FMOE`, a version word and little-endian u32 fields.
    pub fn encode(&self) -> Vec<u8> {
        let fields: [u32; IMAGE_FIELDS] = [
            self.block.block_size_m as u32,
            self.block.block_size_n as u32,
            self.block.block_size_k as u32,
            self.block.group_size_m as u32,
            self.k_divisible as u32,
            self.group_size.as_usize() as u32,
            self.mul_routed_weight as u32,
            self.top_k as u32,
            match self.compute_type {
                ComputeType::F16 => 0,
                ComputeType::BF16 => 1,
            },
        ];
        let mut out = Vec::with_capacity(IMAGE_LEN);
        out.extend_from_slice(IMAGE_MAGIC);
        out.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
        for field in fields {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out
    }

    /// Restore a specialization from [`encode`](Self::encode) output.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != IMAGE_LEN || &bytes[..4] != IMAGE_MAGIC {
            candle_core::bail!("not a fused MoE kernel image ({} bytes)", bytes.len());
        }
        let words: Vec<u32> = bytes[4..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words[0] != IMAGE_VERSION {
            candle_core::bail!("unsupported kernel image version {}", words[0]);
        }
        let f = &words[1..];
        let flag = |v: u32, what: &str| -> Result<bool> {
            match v {
                0 => Ok(false),
                1 => Ok(true),
                other => candle_core::bail!("kernel image: invalid {what} flag {other}"),
            }
        };

        let spec = Self {
            block: FusedMoEBlockConfig::new(
                f[0] as usize,
                f[1] as usize,
                f[2] as usize,
                f[3] as usize,
            ),
            k_divisible: flag(f[4], "k_divisible")?,
            group_size: QuantGroupSize::from_usize(f[5] as usize)?,
            mul_routed_weight: flag(f[6], "mul_routed_weight")?,
            top_k: f[7] as usize,
            compute_type: match f[8] {
                0 => ComputeType::F16,
                1 => ComputeType::BF16,
                other => candle_core::bail!("kernel image: invalid compute type {other}"),
            },
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Text listing of the CPU program for this specialization.
    fn cpu_listing(&self, launch: &LaunchOptions) -> String {
        let b = &self.block;
        let mut s = String::new();
        // Writing into a String cannot fail
        let _ = writeln!(s, ".kernel {}", self.kernel_name());
        let _ = writeln!(s, ".backend cpu");
        let _ = writeln!(
            s,
            ".tile m={} n={} k={} group_m={}",
            b.block_size_m, b.block_size_n, b.block_size_k, b.group_size_m
        );
        let _ = writeln!(
            s,
            ".k_loop {}",
            if self.k_divisible { "unmasked" } else { "masked" }
        );
        let _ = writeln!(
            s,
            ".scales a_group={} b_group={}",
            ACTIVATION_GROUP_SIZE,
            self.group_size.as_usize()
        );
        let _ = writeln!(s, ".top_k {}", self.top_k);
        let _ = writeln!(
            s,
            ".epilogue routed_weight={} store={}",
            self.mul_routed_weight, self.compute_type
        );
        let _ = writeln!(
            s,
            ".launch workers={} chunk={}",
            launch.num_warps, launch.num_stages
        );
        s
    }
}

fn check_cuda_limits(spec: &KernelSpecialization, launch: &LaunchOptions) -> Result<()> {
    let threads = launch.num_warps * 32;
    if threads > 1024 {
        candle_core::bail!("num_warps {} exceeds 1024 threads per block", launch.num_warps);
    }
    let tile = spec.block.block_size_m * spec.block.block_size_n;
    if tile > MAX_ACC_PER_THREAD * threads {
        candle_core::bail!(
            "tile {}x{} needs more than {MAX_ACC_PER_THREAD} accumulators per thread with {} warps",
            spec.block.block_size_m,
            spec.block.block_size_n,
            launch.num_warps
        );
    }
    let smem = spec.shared_mem_bytes(launch);
    if smem > MAX_SHARED_MEM_BYTES {
        candle_core::bail!("kernel needs {smem} bytes of shared memory, limit {MAX_SHARED_MEM_BYTES}");
    }
    Ok(())
}

type KernelKey = (KernelBackend, String, Option<LaunchOptions>);

/// Specialize the kernel for `device`, reusing earlier compilations.
pub fn compile_kernel(
    spec: &KernelSpecialization,
    launch: Option<LaunchOptions>,
    device: &Device,
) -> Result<Arc<CompiledKernel>> {
    static CACHE: OnceLock<Mutex<HashMap<KernelKey, Arc<CompiledKernel>>>> = OnceLock::new();

    spec.validate()?;
    let effective = launch.unwrap_or_default();
    effective.validate()?;

    let backend = KernelBackend::for_device(device)?;
    let name = spec.kernel_name();
    let key = (backend, name.clone(), launch);

    let mut cache = CACHE
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if let Some(kernel) = cache.get(&key) {
        return Ok(kernel.clone());
    }

    let (image, asm) = match backend {
        KernelBackend::Cpu => (spec.encode(), spec.cpu_listing(&effective)),
        KernelBackend::Cuda => {
            check_cuda_limits(spec, &effective)?;
            cuda_module_image()?
        }
    };

    let kernel = Arc::new(CompiledKernel {
        name,
        backend,
        spec: *spec,
        launch,
        image,
        asm,
        shared_mem_bytes: spec.shared_mem_bytes(&effective),
    });
    tracing::debug!(
        kernel = %kernel.name,
        backend = ?backend,
        num_warps = effective.num_warps,
        num_stages = effective.num_stages,
        shared_mem_bytes = kernel.shared_mem_bytes,
        "compiled fused MoE kernel"
    );
    cache.insert(key, kernel.clone());
    Ok(kernel)
}

#[cfg(feature = "cuda-kernels")]
fn cuda_module_image() -> Result<(Vec<u8>, String)> {
    Ok((
        FUSED_MOE_FP8_PTX.as_bytes().to_vec(),
        FUSED_MOE_FP8_PTX.to_string(),
    ))
}

#[cfg(not(feature = "cuda-kernels"))]
fn cuda_module_image() -> Result<(Vec<u8>, String)> {
    candle_core::bail!("fused_moe_fp8: built without the cuda-kernels feature")
}
