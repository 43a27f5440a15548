//! Permutation <=> factorial base representation (Lehmer code).
//!
//! `code[i]` is the rank of `permutation[i]` among the values not yet used
//! by earlier positions. Both directions run in `O(n log n)`: encoding sums
//! over a Fenwick tree, decoding extracts order statistics from an implicit
//! tree over the next power of two.

use crate::error::{Error, Result};

#[inline]
fn lowest_set_bit(v: usize) -> usize {
    v & v.wrapping_neg()
}

/// Computes the Lehmer code of `permutation`, an array of unique indices in
/// `[0, n)`.
pub fn encode_lehmer(permutation: &[u32]) -> Result<Vec<u32>> {
    let n = permutation.len();
    let mut fenwick = vec![0u32; n + 1];
    let mut code = vec![0u32; n];

    for (idx, &s) in permutation.iter().enumerate() {
        let s = s as usize;
        if s >= n {
            return Err(Error::InvalidPermutation("index out of range"));
        }
        // Number of earlier entries smaller than s.
        let mut penalty = 0u32;
        let mut i = s + 1;
        while i != 0 {
            penalty += fenwick[i];
            i &= i - 1;
        }
        if u32::try_from(s).unwrap() < penalty {
            return Err(Error::InvalidPermutation("repeated index"));
        }
        code[idx] = s as u32 - penalty;
        let mut i = s + 1;
        while i < n + 1 {
            fenwick[i] += 1;
            i += lowest_set_bit(i);
        }
    }
    Ok(code)
}

/// Decodes a Lehmer code back into the permutation it was computed from.
pub fn decode_lehmer(code: &[u32]) -> Result<Vec<u32>> {
    let n = code.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    let padded_n = n.next_power_of_two();
    let log2n = padded_n.trailing_zeros() as usize;

    // temp[i] holds the size of the implicit subtree rooted above slot i.
    let mut temp = vec![0u32; padded_n];
    for (i, slot) in temp.iter_mut().enumerate() {
        *slot = lowest_set_bit(i + 1) as u32;
    }

    let mut permutation = vec![0u32; n];
    for (idx, &c) in code.iter().enumerate() {
        if c as usize + idx >= n {
            return Err(Error::InvalidPermutation("factorial digit out of range"));
        }
        let mut rank = c + 1;

        // Extract the rank-th unused element.
        let mut bit = padded_n;
        let mut next = 0usize;
        for _ in 0..=log2n {
            let cand = next + bit;
            bit >>= 1;
            if temp[cand - 1] < rank {
                next = cand;
                rank -= temp[cand - 1];
            }
        }
        permutation[idx] = next as u32;

        // Mark as used.
        let mut i = next + 1;
        while i <= padded_n {
            temp[i - 1] -= 1;
            i += lowest_set_bit(i);
        }
    }
    Ok(permutation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_code() {
        let p = [3u32, 1, 4, 0, 5, 2, 7, 6];
        let code = encode_lehmer(&p).unwrap();
        assert_eq!(code, vec![3, 1, 3, 0, 2, 3, 1, 0]);
        assert_eq!(decode_lehmer(&code).unwrap(), p);
    }

    #[test]
    fn test_identity_and_reverse() {
        let id: Vec<u32> = (0..17).collect();
        assert_eq!(encode_lehmer(&id).unwrap(), vec![0; 17]);
        let rev: Vec<u32> = (0..17).rev().collect();
        let code = encode_lehmer(&rev).unwrap();
        assert_eq!(code, (0..17).rev().collect::<Vec<u32>>());
        assert_eq!(decode_lehmer(&code).unwrap(), rev);
    }

    #[test]
    fn test_repeated_index_rejected() {
        assert!(encode_lehmer(&[3, 1, 4, 1, 5, 9, 2, 6]).is_err());
    }

    #[test]
    fn test_digit_out_of_range_rejected() {
        assert!(decode_lehmer(&[0, 3, 0, 0]).is_err());
    }

    #[test]
    fn test_empty() {
        assert_eq!(encode_lehmer(&[]).unwrap(), Vec::<u32>::new());
        assert_eq!(decode_lehmer(&[]).unwrap(), Vec::<u32>::new());
    }

    proptest! {
        #[test]
        fn prop_round_trip(n in 1usize..64, seed in any::<u64>()) {
            // Fisher-Yates from a simple LCG keeps the test self-contained.
            let mut perm: Vec<u32> = (0..n as u32).collect();
            let mut state = seed | 1;
            for i in (1..n).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                perm.swap(i, j);
            }
            let code = encode_lehmer(&perm).unwrap();
            prop_assert_eq!(decode_lehmer(&code).unwrap(), perm);
        }
    }
}
