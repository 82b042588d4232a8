//! Token grouping for fused MoE execution.
//!
//! Groups flattened `(token, slot)` ids by expert and pads each expert's
//! group to a multiple of the row-block size, so every row-block of the
//! grouped GEMM belongs to exactly one expert.

use candle_core::{DType, Result, Tensor};

/// Expert-grouped ids ready for the grouped GEMM.
#[derive(Debug)]
pub struct AlignedTokens {
    /// Sorted flat ids (`token * top_k + slot`), grouped by expert.
    /// Shape: [max_num_tokens_padded]
    /// Padding positions hold `num_valid_tokens`.
    pub sorted_token_ids: Tensor,

    /// Expert ID for each block of tokens.
    /// Shape: [max_num_blocks]
    /// -1 indicates an unused block past the occupied prefix.
    pub expert_ids: Tensor,

    /// Sum of the padded expert segments, shape [1].
    pub num_tokens_post_padded: Tensor,

    /// Number of valid tokens (before padding).
    pub num_valid_tokens: usize,
}

/// Groups `topk_ids` by expert in row-blocks of `block_size`.
pub struct MoETokenGrouper {
    block_size: usize,
    num_experts: usize,
}

impl MoETokenGrouper {
    pub fn new(block_size: usize, num_experts: usize) -> Self {
        Self {
            block_size,
            num_experts,
        }
    }

    /// Align `topk_ids` (`[num_tokens, top_k]`, U32 or I64) to row-blocks.
    ///
    /// Ids of one expert keep their flat order. Experts with no ids take no
    /// blocks, so occupied blocks form a prefix and the tail of `expert_ids`
    /// is -1.
    pub fn align_block_size(&self, topk_ids: &Tensor) -> Result<AlignedTokens> {
        let bs = self.block_size;
        if bs == 0 || self.num_experts == 0 {
            candle_core::bail!(
                "moe_align_block_size: block_size ({bs}) and num_experts ({}) must be non-zero",
                self.num_experts
            );
        }

        let device = topk_ids.device();
        let (num_tokens, top_k) = topk_ids.dims2()?;
        let num_valid_tokens = num_tokens * top_k;
        let capacity = num_valid_tokens + self.num_experts * (bs - 1);

        let ids: Vec<i64> = topk_ids.flatten_all()?.to_dtype(DType::I64)?.to_vec1()?;
        let experts = ids
            .iter()
            .enumerate()
            .map(|(pos, &e)| {
                usize::try_from(e)
                    .ok()
                    .filter(|&e| e < self.num_experts)
                    .ok_or_else(|| {
                        candle_core::Error::Msg(format!(
                            "moe_align_block_size: expert id {e} at position {pos} \
                             out of range for {} experts",
                            self.num_experts
                        ))
                    })
            })
            .collect::<Result<Vec<usize>>>()?;

        let mut counts = vec![0usize; self.num_experts];
        for &e in &experts {
            counts[e] += 1;
        }
        // Start of each expert's padded segment
        let starts: Vec<usize> = counts
            .iter()
            .scan(0usize, |next, &c| {
                let start = *next;
                *next += c.div_ceil(bs) * bs;
                Some(start)
            })
            .collect();
        let padded_total: usize = counts.iter().map(|c| c.div_ceil(bs) * bs).sum();

        let mut sorted = vec![num_valid_tokens as i64; capacity];
        let mut cursor = starts.clone();
        for (flat, &e) in experts.iter().enumerate() {
            sorted[cursor[e]] = flat as i64;
            cursor[e] += 1;
        }

        let mut block_experts = Vec::with_capacity(capacity.div_ceil(bs));
        for (e, &c) in counts.iter().enumerate() {
            block_experts.extend(std::iter::repeat(e as i64).take(c.div_ceil(bs)));
        }
        block_experts.resize(capacity.div_ceil(bs), -1);

        Ok(AlignedTokens {
            sorted_token_ids: Tensor::new(sorted.as_slice(), device)?,
            expert_ids: Tensor::new(block_experts.as_slice(), device)?,
            num_tokens_post_padded: Tensor::new(&[padded_total as i64], device)?,
            num_valid_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_token_grouper_basic() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(4, 4);

        // Token 0 -> experts [2, 3]
        // Token 1 -> experts [1, 2]
        // Token 2 -> experts [1, 3]
        // Token 3 -> experts [1, 2]
        let topk_ids = Tensor::new(&[[2u32, 3], [1, 2], [1, 3], [1, 2]], &device).unwrap();

        let aligned = grouper.align_block_size(&topk_ids).unwrap();
        let sorted_ids: Vec<i64> = aligned.sorted_token_ids.to_vec1().unwrap();
        let expert_ids: Vec<i64> = aligned.expert_ids.to_vec1().unwrap();
        let padded: Vec<i64> = aligned.num_tokens_post_padded.to_vec1().unwrap();

        assert_eq!(aligned.num_valid_tokens, 8);
        // Expert 0: none, expert 1: 2,4,6 -> 4, expert 2: 0,3,7 -> 4, expert 3: 1,5 -> 4
        assert_eq!(padded, vec![12]);
        // 8 + 4 * 3 slots, 5 blocks
        assert_eq!(sorted_ids.len(), 20);
        assert_eq!(&sorted_ids[..12], &[2, 4, 6, 8, 0, 3, 7, 8, 1, 5, 8, 8]);
        assert!(sorted_ids[12..].iter().all(|&id| id == 8));
        assert_eq!(expert_ids, vec![1, 2, 3, -1, -1]);
    }

    #[test]
    fn test_token_grouper_single_expert() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(4, 8);

        let topk_ids = Tensor::new(&[[0u32, 1], [0, 1], [0, 1], [0, 1]], &device).unwrap();

        let aligned = grouper.align_block_size(&topk_ids).unwrap();
        let sorted_ids: Vec<i64> = aligned.sorted_token_ids.to_vec1().unwrap();
        let expert_ids: Vec<i64> = aligned.expert_ids.to_vec1().unwrap();
        assert_eq!(aligned.num_valid_tokens, 8);
        assert_eq!(&sorted_ids[..8], &[0, 2, 4, 6, 1, 3, 5, 7]);
        assert_eq!(&expert_ids[..2], &[0, 1]);
        assert!(expert_ids[2..].iter().all(|&e| e == -1));
    }

    #[test]
    fn test_token_grouper_padding() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(64, 8);

        let topk_ids = Tensor::new(&[[0u32, 1], [2, 3]], &device).unwrap();

        let aligned = grouper.align_block_size(&topk_ids).unwrap();
        assert_eq!(aligned.num_valid_tokens, 4);

        // Each expert with 1 token gets padded to 64
        let num_tokens_padded: Vec<i64> = aligned.num_tokens_post_padded.to_vec1().unwrap();
        assert_eq!(num_tokens_padded[0], 4 * 64);
    }

    #[test]
    fn test_token_grouper_accepts_i64_ids() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(2, 2);
        let topk_ids = Tensor::new(&[[1i64], [0], [1]], &device).unwrap();
        let aligned = grouper.align_block_size(&topk_ids).unwrap();
        let sorted_ids: Vec<i64> = aligned.sorted_token_ids.to_vec1().unwrap();
        assert_eq!(&sorted_ids[..4], &[1, 3, 0, 2]);
    }

    #[test]
    fn test_token_grouper_rejects_out_of_range_expert() {
        let device = Device::Cpu;
        let grouper = MoETokenGrouper::new(4, 2);
        let topk_ids = Tensor::new(&[[0u32], [2]], &device).unwrap();
        assert!(grouper.align_block_size(&topk_ids).is_err());
    }
}
