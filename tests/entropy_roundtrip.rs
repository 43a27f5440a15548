//! End-to-end round trips of the token entropy coder, framed between two
//! magic sentinels so stream-position agreement is checked as well.

use entrans::{
    build_and_encode_histograms, decode_histograms, write_tokens, Allotment, AnsReader, BitReader,
    BitWriter, MemoryBudget, Token, ANS_MAX_ALPHA_SIZE,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAGIC1: u64 = 0x9e33;
const MAGIC2: u64 = 0x8b04;

fn round_trip_case(num_contexts: usize, tokens: &[Token]) {
    let mut writer = BitWriter::new();
    let allotment = Allotment::new(&writer, 16);
    writer.write(16, MAGIC1);
    allotment.reclaim(&writer);

    let groups = vec![tokens.to_vec()];
    let (codes, context_map) = build_and_encode_histograms(num_contexts, &groups, &mut writer);
    write_tokens(&groups[0], &codes, &context_map, &mut writer);

    let allotment = Allotment::new(&writer, 24);
    writer.write(16, MAGIC2);
    writer.zero_pad_to_byte();
    allotment.reclaim(&writer);

    // The output is not truncated; reading past the end would yield zeros
    // and trip the final checks anyway.
    let bytes = writer.into_bytes();
    let mut reader = BitReader::new(&bytes);
    assert_eq!(reader.read(16), MAGIC1);

    let mut budget = MemoryBudget::default();
    let (code, dec_map) =
        decode_histograms(&mut reader, num_contexts, ANS_MAX_ALPHA_SIZE, &mut budget).unwrap();
    assert_eq!(dec_map, context_map);
    let mut ans = AnsReader::new(&code, &mut reader);
    for token in tokens {
        let symbol = ans.read_symbol(dec_map[token.context as usize], &mut reader);
        assert_eq!(symbol, token.symbol);
        assert_eq!(reader.read(token.nbits as usize) as u32, token.bits);
    }
    assert!(ans.check_final_state());

    assert_eq!(reader.read(16), MAGIC2);
    reader.jump_to_byte_boundary().unwrap();
    reader.close().unwrap();
}

#[test]
fn empty_roundtrip() {
    round_trip_case(2, &[]);
}

#[test]
fn single_symbol_roundtrip() {
    for i in 0..ANS_MAX_ALPHA_SIZE as u32 {
        round_trip_case(2, &[Token::new(0, i)]);
    }
}

#[test]
fn repeated_single_symbol_roundtrip() {
    for i in 0..ANS_MAX_ALPHA_SIZE as u32 {
        round_trip_case(2, &vec![Token::new(0, i); 1024]);
    }
}

fn random_tokens(
    rng: &mut StdRng,
    num: usize,
    num_contexts: u32,
    alphabet_size: u32,
) -> Vec<Token> {
    (0..num)
        .map(|_| {
            let nbits = rng.gen_range(0..=16u32);
            let bits = if nbits == 0 {
                0
            } else {
                rng.gen_range(0..1u32 << nbits)
            };
            Token::with_raw(
                rng.gen_range(0..num_contexts),
                rng.gen_range(0..alphabet_size),
                nbits,
                bits,
            )
        })
        .collect()
}

#[test]
fn random_stream_roundtrip_3_small() {
    let mut rng = StdRng::seed_from_u64(1);
    round_trip_case(3, &random_tokens(&mut rng, 16, 3, 3));
}

#[test]
fn random_stream_roundtrip_3() {
    let mut rng = StdRng::seed_from_u64(2);
    round_trip_case(3, &random_tokens(&mut rng, 1 << 18, 3, 3));
}

#[test]
fn random_stream_roundtrip_big_alphabet() {
    let mut rng = StdRng::seed_from_u64(3);
    round_trip_case(3, &random_tokens(&mut rng, 1 << 16, 3, ANS_MAX_ALPHA_SIZE as u32));
}

/// A staircase distribution: anything nonuniform that usually touches the
/// whole alphabet, and differs enough between contexts.
fn staircase_distribution(rng: &mut StdRng, alphabet_size: usize) -> Vec<u32> {
    const PRECISION: usize = 1 << 10;
    let mut distribution = vec![0u32; PRECISION];
    let mut symbol = 0u32;
    let mut remaining = 1i64;
    for (k, slot) in distribution.iter_mut().enumerate() {
        if remaining == 0 {
            if (symbol as usize) < alphabet_size - 1 {
                symbol += 1;
            }
            remaining = rng.gen_range(0..=PRECISION - k) as i64;
        }
        *slot = symbol;
        remaining -= 1;
    }
    distribution
}

fn unbalanced_roundtrip(alphabet_size: usize) {
    const NUM_HISTOGRAMS: u32 = 3;
    let mut rng = StdRng::seed_from_u64(4);
    let distributions: Vec<Vec<u32>> = (0..NUM_HISTOGRAMS)
        .map(|_| staircase_distribution(&mut rng, alphabet_size))
        .collect();
    let tokens: Vec<Token> = (0..1 << 18)
        .map(|_| {
            let context = rng.gen_range(0..NUM_HISTOGRAMS);
            let value = distributions[context as usize][rng.gen_range(0..1 << 10)];
            let nbits = rng.gen_range(0..=16u32);
            let bits = if nbits == 0 {
                0
            } else {
                rng.gen_range(0..1u32 << nbits)
            };
            Token::with_raw(context, value, nbits, bits)
        })
        .collect();
    // One context past the used ones stays empty and must still decode.
    round_trip_case(NUM_HISTOGRAMS as usize + 1, &tokens);
}

#[test]
fn random_unbalanced_stream_roundtrip_3() {
    unbalanced_roundtrip(3);
}

#[test]
fn random_unbalanced_stream_roundtrip_big_alphabet() {
    unbalanced_roundtrip(ANS_MAX_ALPHA_SIZE);
}

#[test]
fn raw_bits_boundary_values() {
    let tokens = vec![
        Token::with_raw(0, 0, 0, 0),
        Token::with_raw(1, 1, 16, 0xFFFF),
        Token::with_raw(0, 2, 16, 0),
        Token::with_raw(1, 3, 1, 1),
        Token::with_raw(0, 4, 15, 0x7FFF),
    ];
    round_trip_case(2, &tokens);
}

#[test]
fn many_contexts_with_shared_histograms() {
    // 40 contexts drawing from only two distinct distributions; clustering
    // has to keep the stream decodable whatever it merges.
    let mut rng = StdRng::seed_from_u64(5);
    let tokens: Vec<Token> = (0..20_000)
        .map(|_| {
            let context = rng.gen_range(0..40u32);
            let symbol = if context % 2 == 0 {
                rng.gen_range(0..4u32)
            } else {
                rng.gen_range(100..110u32)
            };
            Token::new(context, symbol)
        })
        .collect();
    round_trip_case(40, &tokens);
}
