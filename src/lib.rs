//! # entrans — context-adaptive rANS entropy coding
//!
//! *The entropy coding core of a modern image codec, as a standalone
//! crate.*
//!
//! ## Intuition First
//!
//! An entropy coder turns a stream of symbols into close to
//! `sum(log2(1/p))` bits, where `p` is each symbol's modeled probability.
//! Range ANS (rANS) gets there with a single integer state: encoding a
//! symbol multiplies the state by roughly `1/p`, decoding divides it back
//! out. Because the state is one integer, encode order and decode order are
//! mirror images — the encoder works backwards so the decoder can run
//! forwards.
//!
//! ## What lives here
//!
//! - [`Token`] streams: a context id, a symbol, and optional raw bits that
//!   bypass the model (large values travel as prefix + raw payload).
//! - Per-context [`Histogram`]s, clustered so similar contexts share a
//!   distribution, with the sharing described by a serialized context map.
//! - Fixed-precision rANS tables (12-bit frequencies, 16-bit
//!   renormalization) with a hard final-state check that catches stream
//!   corruption.
//! - A predictive codec for ICC color profiles that rewrites the profile
//!   into near-zero residual bytes and feeds them through the same
//!   backend, including a resumable streaming decoder.
//! - The bit-level writer and reader backing all of the above, plus a
//!   Lehmer permutation code used by the context map.
//!
//! ## Encoding walkthrough
//!
//! ```rust
//! use entrans::{
//!     build_and_encode_histograms, decode_histograms, write_tokens, AnsReader, BitReader,
//!     BitWriter, MemoryBudget, Token, ANS_MAX_ALPHA_SIZE,
//! };
//!
//! let tokens: Vec<Token> = (0..100).map(|i| Token::new(i % 2, i % 5)).collect();
//!
//! let mut writer = BitWriter::new();
//! let groups = vec![tokens.clone()];
//! let (codes, context_map) = build_and_encode_histograms(2, &groups, &mut writer);
//! write_tokens(&tokens, &codes, &context_map, &mut writer);
//! writer.zero_pad_to_byte();
//! let bytes = writer.into_bytes();
//!
//! let mut reader = BitReader::new(&bytes);
//! let mut budget = MemoryBudget::default();
//! let (code, map) = decode_histograms(&mut reader, 2, ANS_MAX_ALPHA_SIZE, &mut budget).unwrap();
//! let mut ans = AnsReader::new(&code, &mut reader);
//! for token in &tokens {
//!     assert_eq!(ans.read_symbol(map[token.context as usize], &mut reader), token.symbol);
//! }
//! assert!(ans.check_final_state());
//! ```
//!
//! ## Failure Modes
//!
//! Decoding is detection-only: malformed histograms, out-of-range context
//! maps, and a final ANS state that is not the canonical constant all
//! surface as [`Error`] values. The sticky out-of-bounds flag of
//! [`BitReader`] separates truncated inputs from corrupt ones, and the ICC
//! reader turns truncation into a resumable suspension.
//!
//! ## References
//!
//! - Duda, J. (2013). "Asymmetric numeral systems: entropy coding
//!   combining speed of Huffman coding with compression rate of arithmetic
//!   coding."
//! - ISO/IEC 15076-1, the ICC profile format targeted by the predictive
//!   codec.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ans;
pub mod bit_reader;
pub mod bit_writer;
pub mod context_map;
pub mod entropy;
pub mod error;
pub mod histogram;
pub mod icc;
pub mod lehmer;
pub mod mem;

pub use ans::{
    AnsCoder, ANS_LOG_TAB_SIZE, ANS_MAX_ALPHA_SIZE, ANS_SIGNATURE, ANS_TAB_SIZE,
};
pub use bit_reader::BitReader;
pub use bit_writer::{Allotment, BitWriter};
pub use context_map::{decode_context_map, encode_context_map, MAX_NUM_HISTOGRAMS};
pub use entropy::{
    build_and_encode_histograms, decode_histograms, write_tokens, AnsCode, AnsReader,
    EntropyEncodingData, Token,
};
pub use error::{Error, Result};
pub use histogram::Histogram;
pub use icc::{predict_icc, read_icc, unpredict_icc, write_icc, IccReader};
pub use lehmer::{decode_lehmer, encode_lehmer};
pub use mem::MemoryBudget;
