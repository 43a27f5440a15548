//! Symbol frequency histograms.
//!
//! Histograms are counted per context, clustered so that similar contexts
//! share a distribution, normalized to the fixed ANS table sum, and finally
//! serialized in one of three forms: an all-zero marker, a singleton, or a
//! general distribution coded with a prefix code plus zero-run lengths.

use crate::ans::{ANS_MAX_ALPHA_SIZE, ANS_TAB_SIZE};
use crate::bit_reader::BitReader;
use crate::bit_writer::BitWriter;
use crate::error::{Error, Result};

/// Merges below this Shannon-cost increase (in bits) are taken even when
/// the cluster count is already under the cap; roughly the serialized size
/// of one more histogram.
const MERGE_SLACK_BITS: f64 = 64.0;

/// A frequency table over symbols `0..alphabet_size`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
    counts: Vec<u32>,
    total: u64,
}

impl Histogram {
    /// Creates an empty histogram.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one occurrence of `symbol`.
    pub fn add(&mut self, symbol: u32) {
        let symbol = symbol as usize;
        assert!(symbol < ANS_MAX_ALPHA_SIZE, "symbol out of range");
        if symbol >= self.counts.len() {
            self.counts.resize(symbol + 1, 0);
        }
        self.counts[symbol] += 1;
        self.total += 1;
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: &Histogram) {
        if other.counts.len() > self.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        for (dst, &src) in self.counts.iter_mut().zip(&other.counts) {
            *dst += src;
        }
        self.total += other.total;
    }

    /// Number of symbols up to and including the last one seen.
    #[must_use]
    pub fn alphabet_size(&self) -> usize {
        match self.counts.iter().rposition(|&c| c > 0) {
            Some(last) => last + 1,
            None => 0,
        }
    }

    /// Total number of recorded occurrences.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Raw counts, untrimmed.
    #[must_use]
    pub fn counts(&self) -> &[u32] {
        &self.counts
    }

    /// Shannon cost of coding the recorded stream with this histogram, in
    /// bits.
    #[must_use]
    pub fn shannon_cost(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let total = self.total as f64;
        self.counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let c = f64::from(c);
                c * (total / c).log2()
            })
            .sum()
    }

    /// Scales the counts to sum exactly [`ANS_TAB_SIZE`], keeping every
    /// seen symbol at count >= 1.
    ///
    /// Returns an empty vector for an empty histogram and the degenerate
    /// `[.., 4096]` table for a single-symbol one.
    #[must_use]
    pub fn normalized(&self) -> Vec<u32> {
        let alphabet = self.alphabet_size();
        if alphabet == 0 {
            return Vec::new();
        }
        let mut normalized = vec![0u32; alphabet];
        let target = ANS_TAB_SIZE as u64;
        for (i, &c) in self.counts[..alphabet].iter().enumerate() {
            if c > 0 {
                let scaled = (u64::from(c) * target + self.total / 2) / self.total;
                normalized[i] = scaled.clamp(1, target) as u32;
            }
        }

        // Rounding drift is settled against the largest counts.
        loop {
            let sum: u64 = normalized.iter().map(|&c| u64::from(c)).sum();
            if sum == target {
                break;
            }
            let argmax = normalized
                .iter()
                .enumerate()
                .max_by_key(|&(_, &c)| c)
                .map(|(i, _)| i)
                .unwrap();
            if sum < target {
                normalized[argmax] += (target - sum) as u32;
            } else {
                let excess = (sum - target).min(u64::from(normalized[argmax]) - 1);
                debug_assert!(excess > 0, "cannot shrink histogram of all-1 counts");
                normalized[argmax] -= excess as u32;
            }
        }
        normalized
    }
}

/// Greedily merges similar histograms and returns the shared tables plus
/// the context -> table index map.
///
/// Contexts that never saw a symbol all map to index 0. The result is
/// guaranteed to contain at most `max_clusters` tables, and every table
/// index in `0..tables.len()` occurs in the map.
pub fn cluster_histograms(
    histograms: &[Histogram],
    max_clusters: usize,
) -> (Vec<Histogram>, Vec<u8>) {
    assert!(max_clusters >= 1 && max_clusters <= 256);

    let mut cluster_of: Vec<usize> = Vec::with_capacity(histograms.len());
    let mut clusters: Vec<Histogram> = Vec::new();
    for histogram in histograms {
        if histogram.total() == 0 {
            cluster_of.push(usize::MAX); // patched to cluster 0 below
        } else {
            cluster_of.push(clusters.len());
            clusters.push(histogram.clone());
        }
    }
    if clusters.is_empty() {
        // Nothing was recorded anywhere; a single empty table serves all.
        return (vec![Histogram::new()], vec![0; histograms.len()]);
    }

    let mut costs: Vec<f64> = clusters.iter().map(Histogram::shannon_cost).collect();
    while clusters.len() > 1 {
        let mut best: Option<(usize, usize, f64)> = None;
        for a in 0..clusters.len() {
            for b in a + 1..clusters.len() {
                let mut merged = clusters[a].clone();
                merged.merge(&clusters[b]);
                let delta = merged.shannon_cost() - costs[a] - costs[b];
                if best.is_none_or(|(_, _, d)| delta < d) {
                    best = Some((a, b, delta));
                }
            }
        }
        let (a, b, delta) = best.unwrap();
        if clusters.len() <= max_clusters && delta > MERGE_SLACK_BITS {
            break;
        }
        let removed = clusters.remove(b);
        clusters[a].merge(&removed);
        costs[a] = clusters[a].shannon_cost();
        costs.remove(b);
        for c in cluster_of.iter_mut().filter(|c| **c != usize::MAX) {
            if *c == b {
                *c = a;
            } else if *c > b {
                *c -= 1;
            }
        }
    }

    let map: Vec<u8> = cluster_of
        .into_iter()
        .map(|c| if c == usize::MAX { 0 } else { c as u8 })
        .collect();
    (clusters, map)
}

/// Writes `v >= 1` as an Elias-gamma code: the bit length in unary, then
/// the value below its leading one.
pub(crate) fn write_gamma(writer: &mut BitWriter, v: u32) {
    debug_assert!(v >= 1);
    let n = 32 - v.leading_zeros() as usize;
    writer.write(n - 1, 0);
    writer.write(1, 1);
    writer.write(n - 1, u64::from(v) & ((1 << (n - 1)) - 1));
}

pub(crate) fn read_gamma(reader: &mut BitReader<'_>) -> Result<u32> {
    let mut zeros = 0usize;
    while reader.read(1) == 0 {
        zeros += 1;
        if zeros > 16 {
            return Err(Error::MalformedHistogram("gamma prefix too long"));
        }
    }
    Ok((1 << zeros) | reader.read(zeros) as u32)
}

/// Serializes a normalized histogram (sum 4096, or empty).
pub fn write_histogram(counts: &[u32], writer: &mut BitWriter) {
    debug_assert!(
        counts.is_empty() || counts.iter().map(|&c| u64::from(c)).sum::<u64>() == ANS_TAB_SIZE as u64
    );
    if counts.is_empty() {
        writer.write(1, 1);
        return;
    }
    let nonzero = counts.iter().filter(|&&c| c > 0).count();
    if nonzero == 1 {
        let symbol = counts.iter().position(|&c| c > 0).unwrap();
        writer.write(1, 0);
        writer.write(1, 1);
        writer.write(12, symbol as u64);
        return;
    }

    writer.write(1, 0);
    writer.write(1, 0);
    write_gamma(writer, counts.len() as u32);
    let mut i = 0;
    while i < counts.len() {
        if counts[i] > 0 {
            writer.write(1, 1);
            write_gamma(writer, counts[i]);
            i += 1;
        } else {
            let run = counts[i..].iter().take_while(|&&c| c == 0).count();
            writer.write(1, 0);
            write_gamma(writer, run as u32);
            i += run;
        }
    }
}

/// Reads one serialized histogram; the inverse of [`write_histogram`].
///
/// Rejects tables whose counts do not sum to 4096, zero counts coded as
/// non-zero, and symbols at or beyond `max_alphabet`.
pub fn read_histogram(reader: &mut BitReader<'_>, max_alphabet: usize) -> Result<Vec<u32>> {
    debug_assert!(max_alphabet <= ANS_MAX_ALPHA_SIZE);
    if reader.read(1) == 1 {
        return Ok(Vec::new());
    }
    if reader.read(1) == 1 {
        let symbol = reader.read(12) as usize;
        if symbol >= max_alphabet {
            return Err(Error::MalformedHistogram("singleton symbol out of range"));
        }
        let mut counts = vec![0u32; symbol + 1];
        counts[symbol] = ANS_TAB_SIZE as u32;
        return Ok(counts);
    }

    let alphabet = read_gamma(reader)? as usize;
    if alphabet > max_alphabet {
        return Err(Error::MalformedHistogram("alphabet too large"));
    }
    let mut counts = vec![0u32; alphabet];
    let mut sum = 0u64;
    let mut i = 0;
    while i < alphabet {
        if reader.read(1) == 1 {
            let c = read_gamma(reader)?;
            if u64::from(c) > ANS_TAB_SIZE as u64 {
                return Err(Error::MalformedHistogram("count exceeds table size"));
            }
            counts[i] = c;
            sum += u64::from(c);
            i += 1;
        } else {
            let run = read_gamma(reader)? as usize;
            if i + run > alphabet {
                return Err(Error::MalformedHistogram("zero run overflows alphabet"));
            }
            i += run;
        }
    }
    if sum != ANS_TAB_SIZE as u64 {
        return Err(Error::MalformedHistogram("counts do not sum to table size"));
    }
    Ok(counts)
}
