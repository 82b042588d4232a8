//! CPU program body of the fused FP8 MoE GEMM.
//!
//! One program instance owns one `BLOCK_SIZE_M x BLOCK_SIZE_N` output tile.
//! Instances share nothing: each decodes its own A/B chunks, accumulates in
//! f32 and hands back a [`Tile`]. Tiles are written into C after every
//! instance has finished, so the scatter never races.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use candle_core::Result;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::config::{FusedMoEBlockConfig, KernelSpecialization, LaunchOptions};
use super::schedule::LaunchGeometry;
use crate::quantization::{fp8_e4m3_table, ACTIVATION_GROUP_SIZE};

/// Borrowed, contiguous kernel operands.
pub(crate) struct KernelArgs<'a> {
    /// `[num_tokens, K]` E4M3 bytes.
    pub a: &'a [u8],
    /// `[num_experts, N, K]` E4M3 bytes.
    pub b: &'a [u8],
    /// `[num_tokens, a_scale_groups]`.
    pub a_scale: &'a [f32],
    /// `[num_experts, N, b_scale_groups]`.
    pub b_scale: &'a [f32],
    /// `[num_tokens * top_k]`.
    pub topk_weights: &'a [f32],
    pub sorted_token_ids: &'a [i64],
    pub expert_ids: &'a [i64],
    pub num_tokens_post_padded: usize,
    pub num_valid_tokens: usize,
    pub num_experts: usize,
    pub n: usize,
    pub k: usize,
    pub a_scale_groups: usize,
    pub b_scale_groups: usize,
}

/// Accumulated output of one program instance.
#[derive(Debug)]
pub(crate) struct Tile {
    /// Flat `(token, slot)` id per row; `None` for padding rows.
    rows: Vec<Option<usize>>,
    col_start: usize,
    width: usize,
    acc: Vec<f32>,
}

#[inline]
fn scale_at(scales: &[f32], row: usize, groups: usize, group: usize) -> f32 {
    if group < groups {
        scales.get(row * groups + group).copied().unwrap_or(0.0)
    } else {
        0.0
    }
}

/// Run program instance `pid`.
///
/// `K_DIVISIBLE` selects the unmasked K loop. The masked variant clips the
/// trailing chunk at `K`.
pub(crate) fn run_program<const K_DIVISIBLE: bool>(
    args: &KernelArgs<'_>,
    spec: &KernelSpecialization,
    geom: &LaunchGeometry,
    pid: usize,
) -> Result<Option<Tile>> {
    let FusedMoEBlockConfig {
        block_size_m: bm,
        block_size_n: bn,
        block_size_k: bk,
        group_size_m,
    } = spec.block;

    let (pid_m, pid_n) = geom.program_tile(pid, group_size_m);
    if pid_m * bm >= args.num_tokens_post_padded {
        return Ok(None);
    }

    let sentinel = args.num_valid_tokens as i64;
    let rows: Vec<Option<usize>> = (0..bm)
        .map(|i| {
            let id = args
                .sorted_token_ids
                .get(pid_m * bm + i)
                .copied()
                .unwrap_or(sentinel);
            (id >= 0 && id < sentinel).then_some(id as usize)
        })
        .collect();

    let mut acc = vec![0f32; bm * bn];
    let col_start = pid_n * bn;

    let expert = args.expert_ids.get(pid_m).copied().unwrap_or(-1);
    if expert < 0 {
        // Unused block: valid rows get zeros
        return Ok(Some(Tile {
            rows,
            col_start,
            width: bn,
            acc,
        }));
    }
    let expert = expert as usize;
    if expert >= args.num_experts {
        candle_core::bail!(
            "fused_moe_fp8: expert id {expert} in block {pid_m} out of range for {} experts",
            args.num_experts
        );
    }

    let table = fp8_e4m3_table();
    let group_size = spec.group_size.as_usize();
    // Wrapped columns keep B loads in bounds; the store masks col >= N
    let cols: Vec<usize> = (0..bn).map(|j| (col_start + j) % args.n).collect();

    let mut a_tile = vec![0f32; bm * bk];
    let mut b_tile = vec![0f32; bn * bk];
    let mut a_scales = vec![0f32; bm];
    let mut b_scales = vec![0f32; bn];

    for chunk in 0..args.k.div_ceil(bk) {
        let k0 = chunk * bk;
        let width = if K_DIVISIBLE { bk } else { bk.min(args.k - k0) };
        let a_group = k0 / ACTIVATION_GROUP_SIZE;
        let b_group = (bk * chunk) / group_size;

        for (i, row) in rows.iter().enumerate() {
            let dst = &mut a_tile[i * bk..i * bk + width];
            match *row {
                Some(id) => {
                    let src_row = id / spec.top_k;
                    let base = src_row * args.k + k0;
                    for (d, &s) in dst.iter_mut().zip(&args.a[base..base + width]) {
                        *d = table[s as usize];
                    }
                    a_scales[i] = scale_at(args.a_scale, src_row, args.a_scale_groups, a_group);
                }
                None => {
                    dst.fill(0.0);
                    a_scales[i] = 0.0;
                }
            }
        }

        for (j, &col) in cols.iter().enumerate() {
            let channel = expert * args.n + col;
            let base = channel * args.k + k0;
            let dst = &mut b_tile[j * bk..j * bk + width];
            for (d, &s) in dst.iter_mut().zip(&args.b[base..base + width]) {
                *d = table[s as usize];
            }
            b_scales[j] = scale_at(args.b_scale, channel, args.b_scale_groups, b_group);
        }

        for (i, row) in rows.iter().enumerate() {
            if row.is_none() {
                continue;
            }
            let a_row = &a_tile[i * bk..i * bk + width];
            let a_s = a_scales[i];
            for (j, out) in acc[i * bn..(i + 1) * bn].iter_mut().enumerate() {
                let b_row = &b_tile[j * bk..j * bk + width];
                let dot: f32 = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
                *out += dot * b_scales[j] * a_s;
            }
        }
    }

    if spec.mul_routed_weight {
        for (i, row) in rows.iter().enumerate() {
            if let Some(id) = *row {
                let w = args.topk_weights.get(id).copied().unwrap_or(0.0);
                acc[i * bn..(i + 1) * bn].iter_mut().for_each(|v| *v *= w);
            }
        }
    }

    Ok(Some(Tile {
        rows,
        col_start,
        width: bn,
        acc,
    }))
}

/// Worker pool per width, shared across launches.
fn worker_pool(num_threads: usize) -> Result<Arc<ThreadPool>> {
    static POOLS: OnceLock<Mutex<HashMap<usize, Arc<ThreadPool>>>> = OnceLock::new();

    let mut pools = POOLS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if let Some(pool) = pools.get(&num_threads) {
        return Ok(pool.clone());
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(move |i| format!("fused-moe-{num_threads}-{i}"))
        .build()
        .map_err(|e| candle_core::Error::Msg(format!("fused_moe_fp8 worker pool: {e}")))?;
    let pool = Arc::new(pool);
    pools.insert(num_threads, pool.clone());
    Ok(pool)
}

/// Run every program instance of the grid.
///
/// `num_warps` sets the worker count and `num_stages` the minimum number of
/// consecutive program ids one worker claims at a time.
pub(crate) fn execute(
    args: &KernelArgs<'_>,
    spec: &KernelSpecialization,
    geom: &LaunchGeometry,
    launch: &LaunchOptions,
) -> Result<Vec<Tile>> {
    let pool = worker_pool(launch.num_warps)?;
    let tiles: Vec<Option<Tile>> = pool.install(|| {
        let programs = (0..geom.num_programs)
            .into_par_iter()
            .with_min_len(launch.num_stages);
        if spec.k_divisible {
            programs
                .map(|pid| run_program::<true>(args, spec, geom, pid))
                .collect::<Result<Vec<_>>>()
        } else {
            programs
                .map(|pid| run_program::<false>(args, spec, geom, pid))
                .collect::<Result<Vec<_>>>()
        }
    })?;
    Ok(tiles.into_iter().flatten().collect())
}

/// Write tiles into a zeroed `[num_valid_tokens, N]` buffer.
///
/// Only valid rows and columns below `N` are stored.
pub(crate) fn scatter<T: Copy>(
    tiles: &[Tile],
    n: usize,
    len: usize,
    zero: T,
    cast: impl Fn(f32) -> T,
) -> Vec<T> {
    let mut out = vec![zero; len];
    for tile in tiles {
        for (i, row) in tile.rows.iter().enumerate() {
            let Some(id) = *row else { continue };
            let acc = &tile.acc[i * tile.width..(i + 1) * tile.width];
            for (j, &v) in acc.iter().enumerate() {
                let col = tile.col_start + j;
                if col >= n {
                    break;
                }
                out[id * n + col] = cast(v);
            }
        }
    }
    out
}
