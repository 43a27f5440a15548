//! Context-adaptive entropy coding of token streams.
//!
//! A [`Token`] couples a context id, a symbol coded by the context's
//! histogram, and optional raw bits that ride along unmodeled. The encoder
//! counts per-context histograms, clusters them through the context map,
//! serializes the shared distributions, and then drives the rANS state
//! machine over the tokens.
//!
//! The ANS register is LIFO, so the encoder walks the tokens in reverse
//! and stages every write; flushing the staging buffer backwards yields a
//! stream the decoder consumes strictly forward: 32-bit initial state,
//! then per token one ANS symbol followed by its raw bits.

use crate::ans::{
    build_decoder_table, build_encoder_table, decode_step, AnsCoder, DecSymbolInfo, EncSymbolInfo,
    ANS_MAX_ALPHA_SIZE, ANS_RENORM_THRESHOLD, ANS_SIGNATURE,
};
use crate::bit_reader::BitReader;
use crate::bit_writer::BitWriter;
use crate::context_map::{decode_context_map, encode_context_map, MAX_NUM_HISTOGRAMS};
use crate::error::{Error, Result};
use crate::histogram::{cluster_histograms, read_histogram, write_histogram, Histogram};
use crate::mem::MemoryBudget;

/// One entropy-coded unit: a symbol in a context, plus raw trailing bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token {
    /// Logical context id; selects the histogram through the context map.
    pub context: u32,
    /// Symbol value, below [`ANS_MAX_ALPHA_SIZE`].
    pub symbol: u32,
    /// Width of the raw remainder, at most 16.
    pub nbits: u32,
    /// Raw remainder, below `2^nbits`.
    pub bits: u32,
}

impl Token {
    /// A token without raw bits.
    #[must_use]
    pub fn new(context: u32, symbol: u32) -> Self {
        Self {
            context,
            symbol,
            nbits: 0,
            bits: 0,
        }
    }

    /// A token carrying `nbits` raw bits.
    #[must_use]
    pub fn with_raw(context: u32, symbol: u32, nbits: u32, bits: u32) -> Self {
        let token = Self {
            context,
            symbol,
            nbits,
            bits,
        };
        token.validate();
        token
    }

    #[inline]
    fn validate(&self) {
        assert!((self.symbol as usize) < ANS_MAX_ALPHA_SIZE, "symbol out of range");
        assert!(self.nbits <= 16, "raw bit width out of range");
        assert!(
            self.bits < (1u32 << self.nbits) || self.nbits == 0 && self.bits == 0,
            "raw bits do not fit their width"
        );
    }
}

/// Encoder-side tables: one entry array per shared histogram.
#[derive(Debug)]
pub struct EntropyEncodingData {
    pub(crate) encoders: Vec<Vec<EncSymbolInfo>>,
}

impl EntropyEncodingData {
    /// Number of shared histograms.
    #[must_use]
    pub fn num_histograms(&self) -> usize {
        self.encoders.len()
    }
}

/// Decoder-side tables: one slot array per shared histogram.
#[derive(Debug)]
pub struct AnsCode {
    pub(crate) tables: Vec<Vec<DecSymbolInfo>>,
}

impl AnsCode {
    /// Number of shared histograms.
    #[must_use]
    pub fn num_histograms(&self) -> usize {
        self.tables.len()
    }
}

/// Counts per-context histograms over all token groups, clusters them, and
/// writes the context map plus the serialized distributions.
///
/// Returns the encoder tables and the context map consumed by
/// [`write_tokens`]. Every token must carry a context below
/// `num_contexts`.
pub fn build_and_encode_histograms(
    num_contexts: usize,
    tokens_by_group: &[Vec<Token>],
    writer: &mut BitWriter,
) -> (EntropyEncodingData, Vec<u8>) {
    let mut histograms = vec![Histogram::new(); num_contexts];
    for tokens in tokens_by_group {
        for token in tokens {
            token.validate();
            assert!((token.context as usize) < num_contexts, "context out of range");
            histograms[token.context as usize].add(token.symbol);
        }
    }

    let (clusters, context_map) = cluster_histograms(&histograms, MAX_NUM_HISTOGRAMS);
    encode_context_map(&context_map, clusters.len(), writer);

    let mut encoders = Vec::with_capacity(clusters.len());
    for cluster in &clusters {
        let normalized = cluster.normalized();
        write_histogram(&normalized, writer);
        encoders.push(build_encoder_table(&normalized));
    }
    (EntropyEncodingData { encoders }, context_map)
}

/// Entropy codes `tokens` into `writer` using previously built tables.
///
/// The tokens must be the ones (or distribution-compatible with the ones)
/// the tables were built from; a zero-frequency symbol is a programming
/// error.
pub fn write_tokens(
    tokens: &[Token],
    codes: &EntropyEncodingData,
    context_map: &[u8],
    writer: &mut BitWriter,
) {
    // Staged (width, bits) records, filled in reverse token order and
    // flushed backwards.
    let mut staged: Vec<(u8, u32)> = Vec::with_capacity(tokens.len());
    let mut coder = AnsCoder::new();
    for token in tokens.iter().rev() {
        token.validate();
        if token.nbits > 0 {
            staged.push((token.nbits as u8, token.bits));
        }
        let histogram = usize::from(context_map[token.context as usize]);
        let info = codes.encoders[histogram][token.symbol as usize];
        if let Some(chunk) = coder.put_symbol(info) {
            staged.push((16, u32::from(chunk)));
        }
    }

    writer.write(32, u64::from(coder.state()));
    for &(nbits, bits) in staged.iter().rev() {
        writer.write(usize::from(nbits), u64::from(bits));
    }
}

/// Reads the context map and the shared histograms, building decoder
/// tables.
///
/// `max_alphabet` bounds the symbol values the histograms may declare.
/// Table memory is charged against `budget`.
pub fn decode_histograms(
    reader: &mut BitReader<'_>,
    num_contexts: usize,
    max_alphabet: usize,
    budget: &mut MemoryBudget,
) -> Result<(AnsCode, Vec<u8>)> {
    let (context_map, num_histograms) = decode_context_map(reader, num_contexts, budget)?;
    let mut tables = Vec::with_capacity(num_histograms);
    for _ in 0..num_histograms {
        budget.charge(crate::ans::ANS_TAB_SIZE * std::mem::size_of::<DecSymbolInfo>())?;
        let counts = read_histogram(reader, max_alphabet).map_err(|e| truncation_or(reader, e))?;
        tables.push(build_decoder_table(&counts)?);
    }
    if !reader.all_reads_within_bounds() {
        return Err(Error::NotEnoughBytes);
    }
    Ok((AnsCode { tables }, context_map))
}

/// A decode error caused by running off the input is a truncation, not a
/// corruption.
pub(crate) fn truncation_or(reader: &BitReader<'_>, e: Error) -> Error {
    if reader.all_reads_within_bounds() {
        e
    } else {
        Error::NotEnoughBytes
    }
}

/// Saved ANS reader position; a plain value.
#[derive(Clone, Copy, Debug)]
pub struct AnsCheckpoint {
    state: u32,
}

/// Decoder-side ANS state machine.
///
/// Borrows the bit reader only for the duration of each call, so the
/// caller stays free to interleave raw-bit reads between symbols.
#[derive(Debug)]
pub struct AnsReader<'a> {
    code: &'a AnsCode,
    state: u32,
}

impl<'a> AnsReader<'a> {
    /// Reads the 32-bit initial state and binds the decoder tables.
    #[must_use]
    pub fn new(code: &'a AnsCode, reader: &mut BitReader<'_>) -> Self {
        let state = reader.read(32) as u32;
        Self { code, state }
    }

    /// Rebinds a decoder at a previously saved position without touching
    /// the bit reader.
    #[must_use]
    pub fn resume(code: &'a AnsCode, checkpoint: AnsCheckpoint) -> Self {
        Self {
            code,
            state: checkpoint.state,
        }
    }

    /// Decodes one symbol under the given histogram index.
    #[inline]
    pub fn read_symbol(&mut self, histogram: u8, reader: &mut BitReader<'_>) -> u32 {
        let table = &self.code.tables[usize::from(histogram)];
        let (symbol, next) = decode_step(self.state, table);
        self.state = next;
        if self.state < ANS_RENORM_THRESHOLD {
            self.state = (self.state << 16) | reader.read(16) as u32;
        }
        u32::from(symbol)
    }

    /// True iff the state came back to the canonical constant; called after
    /// the last expected symbol.
    #[must_use]
    pub fn check_final_state(&self) -> bool {
        self.state == ANS_SIGNATURE
    }

    /// Saves the current position for a later [`AnsReader::restore`].
    #[must_use]
    pub fn save(&self) -> AnsCheckpoint {
        AnsCheckpoint { state: self.state }
    }

    /// Rewinds to a previously saved position.
    pub fn restore(&mut self, checkpoint: AnsCheckpoint) {
        self.state = checkpoint.state;
    }
}
