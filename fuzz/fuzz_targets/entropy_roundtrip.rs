#![no_main]
use entrans::{
    build_and_encode_histograms, decode_histograms, write_tokens, AnsReader, BitReader, BitWriter,
    MemoryBudget, Token, ANS_MAX_ALPHA_SIZE,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: Vec<(u8, u16, u8, u16)>| {
    const NUM_CONTEXTS: u32 = 4;
    let tokens: Vec<Token> = data
        .iter()
        .map(|&(context, symbol, nbits, bits)| {
            let nbits = u32::from(nbits) % 17;
            let bits = if nbits == 0 {
                0
            } else {
                u32::from(bits) & ((1u32 << nbits) - 1)
            };
            Token::with_raw(
                u32::from(context) % NUM_CONTEXTS,
                u32::from(symbol) % ANS_MAX_ALPHA_SIZE as u32,
                nbits,
                bits,
            )
        })
        .collect();

    let mut writer = BitWriter::new();
    let groups = vec![tokens.clone()];
    let (codes, context_map) =
        build_and_encode_histograms(NUM_CONTEXTS as usize, &groups, &mut writer);
    write_tokens(&groups[0], &codes, &context_map, &mut writer);
    writer.zero_pad_to_byte();
    let bytes = writer.into_bytes();

    let mut reader = BitReader::new(&bytes);
    let mut budget = MemoryBudget::default();
    let (code, map) = decode_histograms(
        &mut reader,
        NUM_CONTEXTS as usize,
        ANS_MAX_ALPHA_SIZE,
        &mut budget,
    )
    .expect("own output must decode");
    assert_eq!(map, context_map);
    let mut ans = AnsReader::new(&code, &mut reader);
    for token in &tokens {
        assert_eq!(
            ans.read_symbol(map[token.context as usize], &mut reader),
            token.symbol
        );
        assert_eq!(reader.read(token.nbits as usize) as u32, token.bits);
    }
    assert!(ans.check_final_state());
    assert!(reader.close().is_ok());
});
