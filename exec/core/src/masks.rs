// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bitmap allocation over fixed-width status masks.
//!
//! Slots and CUs are tracked as busy(1)/free(0) bits across arrays of 32-bit
//! words. Bit 0 of mask word 0 is index 0; mask word `n` covers indices
//! `32n..32n+31`.

use bitfield::Bit;

/// Mask word index covering `idx`
pub(crate) fn mask_idx(idx: u32) -> u32 {
    idx >> 5
}

/// Position of `idx` within its mask word
pub(crate) fn idx_in_mask(idx: u32) -> u32 {
    idx & 0x1f
}

/// Global index of bit `bit` within mask word `mask_idx`
pub(crate) fn idx_from_mask(bit: u32, mask_idx: u32) -> u32 {
    bit + (mask_idx << 5)
}

/// First set bit of `mask`, LSB first
pub(crate) fn first_set(mask: u32) -> Option<u32> {
    if mask == 0 {
        return None;
    }
    Some(mask.trailing_zeros())
}

/// First zero bit of `mask`, LSB first
pub(crate) fn first_zero(mask: u32) -> Option<u32> {
    if mask == u32::MAX {
        return None;
    }
    Some((!mask).trailing_zeros())
}

/// Acquire the lowest free index and mark it busy
///
/// # Arguments
/// * `masks`     - Status mask words
/// * `num_masks` - Number of mask words in use
/// * `limit`     - Number of valid indices; bits at or above it are never
///   handed out even when their mask word is in use
///
/// # Returns
/// * `Option<u32>` - Acquired index, or `None` when everything is busy
pub(crate) fn acquire_idx(masks: &mut [u32], num_masks: u32, limit: u32) -> Option<u32> {
    for midx in 0..num_masks {
        let Some(bit) = first_zero(masks[midx as usize]) else {
            continue;
        };
        let idx = idx_from_mask(bit, midx);
        if idx >= limit {
            continue;
        }
        masks[midx as usize] ^= 1 << bit;
        return Some(idx);
    }
    None
}

/// Release index `idx`, marking it free again
pub(crate) fn release_idx(masks: &mut [u32], idx: u32) {
    let midx = mask_idx(idx) as usize;
    let pos = idx_in_mask(idx);
    debug_assert!(masks[midx].bit(pos as usize));
    masks[midx] ^= 1 << pos;
}

/// Whether index `idx` is currently busy
#[allow(unused)]
pub(crate) fn is_busy(masks: &[u32], idx: u32) -> bool {
    masks[mask_idx(idx) as usize].bit(idx_in_mask(idx) as usize)
}

/// First candidate allowed by `cmd_mask` that is not busy per `busy_mask`
pub(crate) fn first_free_candidate(cmd_mask: u32, busy_mask: u32) -> Option<u32> {
    first_set((cmd_mask | busy_mask) ^ busy_mask)
}

/// Total number of busy indices across `num_masks` mask words
pub(crate) fn busy_count(masks: &[u32], num_masks: u32) -> u32 {
    masks
        .iter()
        .take(num_masks as usize)
        .map(|m| m.count_ones())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_round_trip() {
        let mut masks = [0u32; 4];
        let idx = acquire_idx(&mut masks, 1, 16).unwrap();
        assert_eq!(idx, 0);
        assert!(is_busy(&masks, 0));
        release_idx(&mut masks, 0);
        assert!(!is_busy(&masks, 0));
        assert_eq!(busy_count(&masks, 4), 0);
    }

    #[test]
    fn test_acquire_exhausts_at_limit() {
        let mut masks = [0u32; 4];
        for expected in 0..16 {
            assert_eq!(acquire_idx(&mut masks, 1, 16), Some(expected));
        }
        // mask word still has free bits past the limit
        assert_eq!(acquire_idx(&mut masks, 1, 16), None);
    }

    #[test]
    fn test_acquire_crosses_mask_words() {
        let mut masks = [u32::MAX, 0, 0, 0];
        assert_eq!(acquire_idx(&mut masks, 4, 128), Some(32));
        assert!(is_busy(&masks, 32));
    }

    #[test]
    fn test_acquire_full_128() {
        let mut masks = [0u32; 4];
        for expected in 0..128 {
            assert_eq!(acquire_idx(&mut masks, 4, 128), Some(expected));
        }
        assert_eq!(acquire_idx(&mut masks, 4, 128), None);
        assert_eq!(busy_count(&masks, 4), 128);
    }

    #[test]
    fn test_candidate_skips_busy() {
        // command allows CUs 0..2, CU 0 busy
        assert_eq!(first_free_candidate(0b0111, 0b0001), Some(1));
        // everything allowed is busy
        assert_eq!(first_free_candidate(0b0011, 0b0011), None);
        // empty command mask never yields a candidate
        assert_eq!(first_free_candidate(0, 0), None);
    }

    #[test]
    fn test_mask_index_math() {
        assert_eq!(mask_idx(67), 2);
        assert_eq!(idx_in_mask(67), 3);
        assert_eq!(idx_from_mask(3, 2), 67);
    }
}
