//! Kernel dump: binary image, launch metadata and listing.
//!
//! For a kernel named `NAME` three files land in the output directory:
//!
//! | File         | Contents                                                   |
//! |--------------|------------------------------------------------------------|
//! | `NAME.bin`   | module image (PTX on CUDA, specialization record on CPU)   |
//! | `NAME.json`  | `{"shm_size": ..}`, plus `num_warps`/`num_stages` if tuned |
//! | `NAME.txt`   | `//shared_memory: S, kernel_name: E` then the listing      |

use std::fs;
use std::path::{Path, PathBuf};

use fused_moe_core::moe::fused::CompiledKernel;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Contents of `NAME.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMetadata {
    pub shm_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_warps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_stages: Option<usize>,
}

impl KernelMetadata {
    pub fn for_kernel(kernel: &CompiledKernel) -> Self {
        Self {
            shm_size: kernel.shared_mem_bytes,
            num_warps: kernel.launch.map(|l| l.num_warps),
            num_stages: kernel.launch.map(|l| l.num_stages),
        }
    }
}

/// Files written by [`dump_kernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub image: PathBuf,
    pub metadata: PathBuf,
    pub listing: PathBuf,
}

impl ArtifactPaths {
    pub fn new(output_dir: &Path, name: &str) -> Self {
        Self {
            image: output_dir.join(format!("{name}.bin")),
            metadata: output_dir.join(format!("{name}.json")),
            listing: output_dir.join(format!("{name}.txt")),
        }
    }
}

/// Header line of the listing file.
pub fn listing_header(kernel: &CompiledKernel) -> String {
    format!(
        "//shared_memory: {}, kernel_name: {}",
        kernel.shared_mem_bytes,
        kernel.entry_point()
    )
}

/// Write the three artifacts of `kernel` into `output_dir`, replacing any
/// earlier dump of the same name.
pub fn dump_kernel(kernel: &CompiledKernel, output_dir: &Path) -> Result<ArtifactPaths> {
    fs::create_dir_all(output_dir)?;
    let paths = ArtifactPaths::new(output_dir, &kernel.name);

    fs::write(&paths.image, &kernel.image)?;
    fs::write(
        &paths.metadata,
        serde_json::to_string(&KernelMetadata::for_kernel(kernel))?,
    )?;
    fs::write(
        &paths.listing,
        format!("{}\n{}\n", listing_header(kernel), kernel.asm),
    )?;

    tracing::debug!(
        image = %paths.image.display(),
        tuned = kernel.launch.is_some(),
        "dumped kernel artifacts"
    );
    Ok(paths)
}
