//! Launch geometry and program-to-tile mapping.

use super::config::FusedMoEBlockConfig;

/// Grid shape of one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    /// Effective number of sorted rows covered by the grid.
    pub em: usize,
    pub num_pid_m: usize,
    pub num_pid_n: usize,
    pub num_programs: usize,
}

/// Compute the launch grid for a problem.
///
/// `EM` is the length of `sorted_token_ids`, except for batches smaller than
/// one row-block where it is capped at `num_tokens * top_k * block_size_m`:
/// with fewer tokens than `block_size_m` at most that many blocks can be
/// occupied, so the tail of a large padded buffer is never launched.
pub fn launch_geometry(
    num_tokens: usize,
    top_k: usize,
    sorted_len: usize,
    n: usize,
    block: &FusedMoEBlockConfig,
) -> LaunchGeometry {
    let mut em = sorted_len;
    if num_tokens < block.block_size_m {
        em = em.min(num_tokens * top_k * block.block_size_m);
    }
    let num_pid_m = em.div_ceil(block.block_size_m);
    let num_pid_n = n.div_ceil(block.block_size_n);
    LaunchGeometry {
        em,
        num_pid_m,
        num_pid_n,
        num_programs: num_pid_m * num_pid_n,
    }
}

impl LaunchGeometry {
    /// Map a linear program id to its `(pid_m, pid_n)` tile.
    ///
    /// Programs are walked in groups of `group_size_m` row-blocks so that
    /// consecutive programs reuse the same columns of B.
    #[inline]
    pub fn program_tile(&self, pid: usize, group_size_m: usize) -> (usize, usize) {
        let num_pid_in_group = group_size_m * self.num_pid_n;
        let group_id = pid / num_pid_in_group;
        let first_pid_m = group_id * group_size_m;
        let group_size_m = (self.num_pid_m - first_pid_m).min(group_size_m);
        let pid_in_group = pid % num_pid_in_group;
        let pid_m = first_pid_m + pid_in_group % group_size_m;
        let pid_n = pid_in_group / group_size_m;
        (pid_m, pid_n)
    }
}
