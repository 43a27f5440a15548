//! Context map serialization.
//!
//! The map from context id to histogram index is recency-biased, so it is
//! passed through a Move-To-Front transform and the MTF positions are
//! entropy coded as a nested single-context stream through the same ANS
//! backend. When a non-trivial starting order of the MTF list pays for
//! itself, it is sent as a Lehmer code ahead of the stream.

use crate::bit_reader::BitReader;
use crate::bit_writer::BitWriter;
use crate::entropy::{
    build_and_encode_histograms, decode_histograms, truncation_or, write_tokens, AnsReader, Token,
};
use crate::error::{Error, Result};
use crate::histogram::Histogram;
use crate::lehmer::{decode_lehmer, encode_lehmer};
use crate::mem::MemoryBudget;

/// Histogram indices and MTF positions stay below this cap.
pub const MAX_NUM_HISTOGRAMS: usize = 256;

/// Writes `num` in `1..=256` as the small prefix code: a zero bit for one
/// histogram, else a 3-bit exponent and its mantissa.
pub(crate) fn write_histogram_count(writer: &mut BitWriter, num: usize) {
    debug_assert!((1..=MAX_NUM_HISTOGRAMS).contains(&num));
    let v = (num - 1) as u32;
    if v == 0 {
        writer.write(1, 0);
    } else {
        writer.write(1, 1);
        let n = (31 - v.leading_zeros()) as usize;
        writer.write(3, n as u64);
        writer.write(n, u64::from(v) & ((1 << n) - 1));
    }
}

pub(crate) fn read_histogram_count(reader: &mut BitReader<'_>) -> Result<usize> {
    if reader.read(1) == 0 {
        return Ok(1);
    }
    let n = reader.read(3) as usize;
    Ok(1 + (1 << n) + reader.read(n) as usize)
}

/// Bits needed to store one value in `0..m`.
fn digit_width(m: usize) -> usize {
    if m <= 1 {
        0
    } else {
        (usize::BITS - (m - 1).leading_zeros()) as usize
    }
}

fn mtf_transform(map: &[u8], initial: &[u8]) -> Vec<u8> {
    let mut list = initial.to_vec();
    map.iter()
        .map(|&value| {
            let pos = list.iter().position(|&v| v == value).unwrap();
            list[..=pos].rotate_right(1);
            pos as u8
        })
        .collect()
}

fn mtf_inverse(positions: &[u8], initial: &[u8]) -> Vec<u8> {
    let mut list = initial.to_vec();
    positions
        .iter()
        .map(|&pos| {
            let value = list[pos as usize];
            list[..=pos as usize].rotate_right(1);
            value
        })
        .collect()
}

fn stream_cost(positions: &[u8]) -> f64 {
    let mut h = Histogram::new();
    for &p in positions {
        h.add(u32::from(p));
    }
    h.shannon_cost()
}

/// Serializes the context map together with the histogram count.
///
/// `num_histograms` must equal `1 + max(map)` and every index below it must
/// occur in the map.
pub fn encode_context_map(map: &[u8], num_histograms: usize, writer: &mut BitWriter) {
    debug_assert_eq!(
        num_histograms,
        1 + map.iter().copied().max().map_or(0, usize::from)
    );
    write_histogram_count(writer, num_histograms);
    if num_histograms == 1 {
        return;
    }

    // Candidate starting order: most frequent histogram index first. Taken
    // only when the Lehmer overhead is smaller than what the reordered MTF
    // stream saves.
    let identity: Vec<u8> = (0..num_histograms as u8).collect();
    let mut by_frequency = identity.clone();
    let mut freq = [0u32; MAX_NUM_HISTOGRAMS];
    for &m in map {
        freq[usize::from(m)] += 1;
    }
    by_frequency.sort_by_key(|&i| std::cmp::Reverse(freq[usize::from(i)]));

    let identity_stream = mtf_transform(map, &identity);
    let sorted_stream = mtf_transform(map, &by_frequency);
    let perm_bits: usize = (0..num_histograms)
        .map(|i| digit_width(num_histograms - i))
        .sum();
    let use_perm =
        stream_cost(&sorted_stream) + perm_bits as f64 + 1.0 < stream_cost(&identity_stream);

    let positions;
    if use_perm {
        writer.write(1, 1);
        let perm: Vec<u32> = by_frequency.iter().map(|&v| u32::from(v)).collect();
        let code = encode_lehmer(&perm).expect("initial MTF list is a permutation");
        for (i, &digit) in code.iter().enumerate() {
            writer.write(digit_width(num_histograms - i), u64::from(digit));
        }
        positions = sorted_stream;
    } else {
        writer.write(1, 0);
        positions = identity_stream;
    }

    let tokens: Vec<Token> = positions
        .iter()
        .map(|&p| Token::new(0, u32::from(p)))
        .collect();
    let (codes, nested_map) = build_and_encode_histograms(1, std::slice::from_ref(&tokens), writer);
    write_tokens(&tokens, &codes, &nested_map, writer);
}

/// Reads the histogram count and the context map; the inverse of
/// [`encode_context_map`].
pub fn decode_context_map(
    reader: &mut BitReader<'_>,
    num_contexts: usize,
    budget: &mut MemoryBudget,
) -> Result<(Vec<u8>, usize)> {
    let num_histograms = read_histogram_count(reader)?;
    if num_histograms > MAX_NUM_HISTOGRAMS {
        return Err(Error::BadContextMap("histogram count exceeds cap"));
    }
    if num_histograms == 1 {
        return Ok((vec![0; num_contexts], 1));
    }

    let initial: Vec<u8> = if reader.read(1) == 1 {
        let mut code = vec![0u32; num_histograms];
        for (i, digit) in code.iter_mut().enumerate() {
            *digit = reader.read(digit_width(num_histograms - i)) as u32;
        }
        let perm = decode_lehmer(&code)
            .map_err(|_| truncation_or(reader, Error::BadContextMap("bad MTF permutation")))?;
        perm.into_iter().map(|v| v as u8).collect()
    } else {
        (0..num_histograms as u8).collect()
    };

    let (codes, nested_map) = decode_histograms(reader, 1, MAX_NUM_HISTOGRAMS, budget)?;
    let mut ans = AnsReader::new(&codes, reader);
    let mut positions = Vec::with_capacity(num_contexts);
    for _ in 0..num_contexts {
        let pos = ans.read_symbol(nested_map[0], reader);
        if pos as usize >= num_histograms {
            return Err(truncation_or(
                reader,
                Error::BadContextMap("MTF position out of range"),
            ));
        }
        positions.push(pos as u8);
    }
    if !ans.check_final_state() {
        return Err(truncation_or(reader, Error::AnsFinalStateMismatch));
    }

    let map = mtf_inverse(&positions, &initial);
    debug_assert!(map.iter().all(|&m| usize::from(m) < num_histograms));
    Ok((map, num_histograms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(map: &[u8]) -> (Vec<u8>, usize) {
        let num = 1 + usize::from(*map.iter().max().unwrap());
        let mut w = BitWriter::new();
        encode_context_map(map, num, &mut w);
        w.zero_pad_to_byte();
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        let out = decode_context_map(&mut r, map.len(), &mut MemoryBudget::default()).unwrap();
        r.close().unwrap();
        out
    }

    #[test]
    fn test_histogram_count_code() {
        for num in [1usize, 2, 3, 4, 5, 9, 17, 100, 255, 256] {
            let mut w = BitWriter::new();
            write_histogram_count(&mut w, num);
            w.zero_pad_to_byte();
            let bytes = w.into_bytes();
            let mut r = BitReader::new(&bytes);
            assert_eq!(read_histogram_count(&mut r).unwrap(), num);
        }
    }

    #[test]
    fn test_trivial_map_is_one_bit() {
        let mut w = BitWriter::new();
        encode_context_map(&[0, 0, 0, 0], 1, &mut w);
        assert_eq!(w.bits_written(), 1);
        let (map, num) = round_trip(&[0, 0, 0, 0]);
        assert_eq!(map, vec![0, 0, 0, 0]);
        assert_eq!(num, 1);
    }

    #[test]
    fn test_mtf_round_trip_identity_list() {
        let initial: Vec<u8> = (0..4).collect();
        let map = [2u8, 2, 0, 1, 3, 3, 3, 0];
        let positions = mtf_transform(&map, &initial);
        assert_eq!(mtf_inverse(&positions, &initial), map);
    }

    #[test]
    fn test_small_map_round_trip() {
        let map = [0u8, 1, 0, 2, 1, 0, 0, 2];
        let (decoded, num) = round_trip(&map);
        assert_eq!(decoded, map);
        assert_eq!(num, 3);
    }

    #[test]
    fn test_permuted_initial_list_decodes() {
        // Hand-build a stream that uses a non-identity starting order, so
        // the Lehmer branch of the decoder is pinned even when the encoder
        // heuristic prefers the identity list.
        let num = 4usize;
        let initial = [2u8, 0, 3, 1];
        let map = [2u8, 2, 3, 0, 1, 2];
        let positions = mtf_transform(&map, &initial);

        let mut w = BitWriter::new();
        write_histogram_count(&mut w, num);
        w.write(1, 1);
        let code = encode_lehmer(&[2, 0, 3, 1]).unwrap();
        for (i, &digit) in code.iter().enumerate() {
            w.write(digit_width(num - i), u64::from(digit));
        }
        let tokens: Vec<Token> = positions
            .iter()
            .map(|&p| Token::new(0, u32::from(p)))
            .collect();
        let (codes, nested_map) =
            build_and_encode_histograms(1, std::slice::from_ref(&tokens), &mut w);
        write_tokens(&tokens, &codes, &nested_map, &mut w);
        w.zero_pad_to_byte();
        let bytes = w.into_bytes();

        let mut r = BitReader::new(&bytes);
        let (decoded, k) =
            decode_context_map(&mut r, map.len(), &mut MemoryBudget::default()).unwrap();
        r.close().unwrap();
        assert_eq!(k, 4);
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_max_histograms_round_trip() {
        let map: Vec<u8> = (0..=255u8).collect();
        let (decoded, num) = round_trip(&map);
        assert_eq!(decoded, map);
        assert_eq!(num, 256);
    }
}
