//! Configuration for fused MoE kernels.

use candle_core::{DType, Result};

use crate::quantization::ACTIVATION_GROUP_SIZE;

/// Block size configuration for fused MoE kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FusedMoEBlockConfig {
    /// Block size for M dimension (tokens).
    pub block_size_m: usize,
    /// Block size for N dimension (output features).
    pub block_size_n: usize,
    /// Block size for K dimension (input features).
    pub block_size_k: usize,
    /// Group size for M dimension (L2 cache optimization).
    pub group_size_m: usize,
}

impl Default for FusedMoEBlockConfig {
    fn default() -> Self {
        Self {
            block_size_m: 64,
            block_size_n: 64,
            block_size_k: 32,
            group_size_m: 8,
        }
    }
}

impl FusedMoEBlockConfig {
    pub fn new(
        block_size_m: usize,
        block_size_n: usize,
        block_size_k: usize,
        group_size_m: usize,
    ) -> Self {
        Self {
            block_size_m,
            block_size_n,
            block_size_k,
            group_size_m,
        }
    }

    /// Check tile sizes against the scale group layout.
    ///
    /// Every K chunk must sit inside a single activation group and a single
    /// weight group, so `block_size_k` has to divide both.
    pub fn validate(&self, group_size: QuantGroupSize) -> Result<()> {
        if self.block_size_m == 0
            || self.block_size_n == 0
            || self.block_size_k == 0
            || self.group_size_m == 0
        {
            candle_core::bail!("block sizes must be non-zero, got {self:?}");
        }
        if ACTIVATION_GROUP_SIZE % self.block_size_k != 0 {
            candle_core::bail!(
                "BLOCK_SIZE_K {} must divide the activation group size {}",
                self.block_size_k,
                ACTIVATION_GROUP_SIZE
            );
        }
        if group_size.as_usize() % self.block_size_k != 0 {
            candle_core::bail!(
                "BLOCK_SIZE_K {} must divide the weight group size {}",
                self.block_size_k,
                group_size.as_usize()
            );
        }
        Ok(())
    }
}

/// Output element type of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeType {
    F16,
    BF16,
}

impl ComputeType {
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
        }
    }

    /// Name used in kernel names and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F16 => "FP16",
            Self::BF16 => "BF16",
        }
    }
}

impl std::fmt::Display for ComputeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Columns of K covered by one weight scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantGroupSize {
    G64,
    G128,
}

impl QuantGroupSize {
    pub fn as_usize(self) -> usize {
        match self {
            Self::G64 => 64,
            Self::G128 => 128,
        }
    }

    pub fn from_usize(size: usize) -> Result<Self> {
        match size {
            64 => Ok(Self::G64),
            128 => Ok(Self::G128),
            other => candle_core::bail!("unsupported weight group size {other}, expected 64 or 128"),
        }
    }
}

/// Scheduling knobs that never change results.
///
/// On CUDA these are warps per thread block and shared-memory pipeline
/// depth. The CPU executor maps them to worker threads and the number of
/// program instances claimed per work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchOptions {
    pub num_warps: usize,
    pub num_stages: usize,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            num_warps: 4,
            num_stages: 3,
        }
    }
}

impl LaunchOptions {
    pub fn new(num_warps: usize, num_stages: usize) -> Self {
        Self {
            num_warps,
            num_stages,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_warps == 0 || self.num_stages == 0 {
            candle_core::bail!("num_warps and num_stages must be non-zero, got {self:?}");
        }
        Ok(())
    }
}

/// Everything fixed at kernel specialization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelSpecialization {
    pub block: FusedMoEBlockConfig,
    /// `K % block_size_k == 0`; selects the unmasked K loop.
    pub k_divisible: bool,
    pub group_size: QuantGroupSize,
    pub mul_routed_weight: bool,
    pub top_k: usize,
    pub compute_type: ComputeType,
}

impl KernelSpecialization {
    pub fn validate(&self) -> Result<()> {
        self.block.validate(self.group_size)?;
        if self.top_k == 0 {
            candle_core::bail!("top_k must be non-zero");
        }
        Ok(())
    }

    /// Stable kernel name, also used as the artifact file stem.
    pub fn kernel_name(&self) -> String {
        format!(
            "fused_moe_gptq_int4_fp8_kernel_BLOCK_SIZE_M_{}_BLOCK_SIZE_N_{}_BLOCK_SIZE_K_{}_GROUP_SIZE_M_{}_MUL_ROUTED_WEIGHT_{}_top_k_{}_compute_type_{}_group_size_{}",
            self.block.block_size_m,
            self.block.block_size_n,
            self.block.block_size_k,
            self.block.group_size_m,
            if self.mul_routed_weight { "True" } else { "False" },
            self.top_k,
            self.compute_type,
            self.group_size.as_usize(),
        )
    }

    /// Shared memory for one thread block: a ring of `num_stages` A/B tiles
    /// with their scales, plus the resolved token ids.
    pub fn shared_mem_bytes(&self, launch: &LaunchOptions) -> usize {
        let FusedMoEBlockConfig {
            block_size_m: bm,
            block_size_n: bn,
            block_size_k: bk,
            ..
        } = self.block;
        launch.num_stages * (bm * bk + bn * bk + 4 * (bm + bn)) + 8 * bm
    }
}
