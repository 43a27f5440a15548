//! ICC profile predictive codec.
//!
//! ICC profiles are small tag-oriented binary blobs with a rigid layout: a
//! 128-byte header, a tag table, and tag data full of big-endian integers
//! and four-character keywords. The encoder exploits that structure with a
//! lossless pre-transform producing a *commands* stream and a *data*
//! stream, which then go through the shared rANS backend byte by byte.
//!
//! Wire layout of the predicted stream:
//! `VarInt(output_size) || VarInt(commands_size) || commands || data`,
//! with VarInt an unsigned LEB128 of at most 10 bytes.
//!
//! Decoding is resumable: [`IccReader`] suspends with
//! [`Error::NotEnoughBytes`] when the bit reader runs dry and picks up from
//! its last checkpoint when the caller supplies more input.

use crate::bit_reader::BitReader;
use crate::bit_writer::BitWriter;
use crate::entropy::{
    build_and_encode_histograms, decode_histograms, write_tokens, AnsCheckpoint, AnsCode,
    AnsReader, Token,
};
use crate::error::{Error, Result};
use crate::mem::MemoryBudget;

/// Fixed size of the ICC profile header.
pub const ICC_HEADER_SIZE: usize = 128;
/// Hard cap on the declared profile size.
pub const MAX_ICC_SIZE: u64 = 1 << 28;
/// The predicted stream may exceed the declared profile size by at most
/// this many bytes.
pub const MAX_ICC_EXPANSION: u64 = 65536;
/// Contexts used when entropy coding the predicted stream.
pub const NUM_ICC_CONTEXTS: usize = 41;
/// Symbols decoded between two ANS checkpoints of the streaming reader.
pub const MAX_CHECKPOINT_INTERVAL: usize = 512;

// Main-content commands.
const CMD_INSERT: u8 = 1;
const CMD_SHUFFLE2: u8 = 2;
const CMD_SHUFFLE4: u8 = 3;
const CMD_PREDICT: u8 = 4;
const CMD_XYZ: u8 = 10;
const CMD_TYPE_START: u8 = 16;

// Tag-list commands, in the low 6 bits of the command byte.
const CMD_TAG_UNKNOWN: u8 = 1;
const CMD_TAG_TRC: u8 = 2;
const CMD_TAG_XYZ: u8 = 3;
const CMD_TAG_STRING_FIRST: u8 = 4;
const FLAG_OFFSET: u8 = 64;
const FLAG_SIZE: u8 = 128;

type Keyword = [u8; 4];

const TAG_RTRC: Keyword = *b"rTRC";
const TAG_GTRC: Keyword = *b"gTRC";
const TAG_BTRC: Keyword = *b"bTRC";
const TAG_RXYZ: Keyword = *b"rXYZ";
const TAG_GXYZ: Keyword = *b"gXYZ";
const TAG_BXYZ: Keyword = *b"bXYZ";

const TAG_STRINGS: [Keyword; 17] = [
    *b"cprt", *b"wtpt", *b"bkpt", *b"rXYZ", *b"gXYZ", *b"bXYZ", *b"kXYZ", *b"rTRC", *b"gTRC",
    *b"bTRC", *b"kTRC", *b"chad", *b"desc", *b"chrm", *b"dmnd", *b"dmdd", *b"lumi",
];

/// Tags whose data is a single XYZ number; their size is predicted as 20.
const SIZE_20_TAGS: [Keyword; 7] = [
    *b"rXYZ", *b"gXYZ", *b"bXYZ", *b"kXYZ", *b"wtpt", *b"bkpt", *b"lumi",
];

const TYPE_STRINGS: [Keyword; 13] = [
    *b"XYZ ", *b"desc", *b"text", *b"mluc", *b"para", *b"curv", *b"sf32", *b"gbd ", *b"view",
    *b"meas", *b"sig ", *b"chrm", *b"mft2",
];

fn append_keyword(out: &mut Vec<u8>, keyword: Keyword) {
    out.extend_from_slice(&keyword);
}

fn append_u32(out: &mut Vec<u8>, value: u64) -> Result<()> {
    if value > u64::from(u32::MAX) {
        return Err(Error::IccInconsistent("field does not fit 32 bits"));
    }
    out.extend_from_slice(&(value as u32).to_be_bytes());
    Ok(())
}

/// Writes `value` as unsigned LEB128.
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 127) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 128);
    }
}

/// Reads an unsigned LEB128 value of at most 10 bytes from `data[*pos..limit]`.
fn read_varint(data: &[u8], pos: &mut usize, limit: usize) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..10 {
        if *pos >= limit {
            return Err(Error::IccInconsistent("truncated varint"));
        }
        let byte = data[*pos];
        *pos += 1;
        value |= u64::from(byte & 127) << (7 * i);
        if byte & 128 == 0 {
            return Ok(value);
        }
    }
    Err(Error::IccInconsistent("varint too long"))
}

/// Takes `num` bytes from the data stream, guarding against overflowing
/// lengths.
fn take_bytes<'a>(enc: &'a [u8], pos: &mut usize, num: u64) -> Result<&'a [u8]> {
    if num > (enc.len() - *pos) as u64 {
        return Err(Error::IccInconsistent("data stream out of bounds"));
    }
    let start = *pos;
    *pos += num as usize;
    Ok(&enc[start..*pos])
}

/// Source index sequence of the byte transpose used by the shuffle
/// commands: reading the stored (planar) form in this order yields the
/// interleaved output.
fn shuffle_map(size: usize, width: usize) -> Vec<usize> {
    let height = size.div_ceil(width);
    let mut map = Vec::with_capacity(size);
    let mut s = 0;
    let mut j = 0;
    for _ in 0..size {
        map.push(j);
        j += height;
        if j >= size {
            s += 1;
            j = s;
        }
    }
    map
}

/// Interleaves planar bytes: with width 2, turns `ABCDabcd` into
/// `AaBbCcDd`.
fn shuffle(data: &mut [u8], width: usize) {
    let map = shuffle_map(data.len(), width);
    let src = data.to_vec();
    for (dst, &j) in data.iter_mut().zip(&map) {
        *dst = src[j];
    }
}

/// The inverse of [`shuffle`]; used by the encoder to store residuals in
/// planar form.
fn unshuffle(data: &mut [u8], width: usize) {
    let map = shuffle_map(data.len(), width);
    let src = data.to_vec();
    for (i, &j) in map.iter().enumerate() {
        data[j] = src[i];
    }
}

fn read_sample(data: &[u8], pos: usize, width: usize) -> u64 {
    let mut v = 0u64;
    for j in 0..width {
        v = (v << 8) | u64::from(data[pos + j]);
    }
    v
}

/// Predicts byte `start + i` from earlier output, treating the stream as
/// width-byte big-endian samples spaced `stride` apart.
///
/// The caller guarantees `stride >= width` and `start > 4 * stride`, which
/// keeps every referenced index in bounds.
fn linear_predict(data: &[u8], start: usize, i: usize, stride: usize, width: usize, order: usize) -> u8 {
    if order == 0 {
        return 0;
    }
    let part = i % width;
    let sample_base = start + i - part;
    let v1 = read_sample(data, sample_base - stride, width);
    let predicted = if order == 1 {
        v1
    } else {
        let v2 = read_sample(data, sample_base - 2 * stride, width);
        v1.wrapping_mul(2).wrapping_sub(v2)
    };
    (predicted >> (8 * (width - 1 - part))) as u8
}

/// The fixed 128-byte header prediction, seeded from the declared profile
/// size.
fn initial_header_prediction(osize: u64) -> [u8; ICC_HEADER_SIZE] {
    let mut header = [0u8; ICC_HEADER_SIZE];
    header[0..4].copy_from_slice(&(osize as u32).to_be_bytes());
    header[8] = 4; // most profiles declare version 4.0
    header[12..16].copy_from_slice(b"mntr");
    header[16..20].copy_from_slice(b"RGB ");
    header[20..24].copy_from_slice(b"XYZ ");
    header[36..40].copy_from_slice(b"acsp");
    // D50 PCS illuminant.
    header[68..72].copy_from_slice(&0x0000_F6D6u32.to_be_bytes());
    header[72..76].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    header[76..80].copy_from_slice(&0x0000_D32Du32.to_be_bytes());
    header
}

/// Per-byte header refinement from the already reconstructed prefix: the
/// profile creator field usually repeats the CMM type.
fn predict_header(prefix: &[u8], header: &mut [u8; ICC_HEADER_SIZE], i: usize) {
    if (80..84).contains(&i) && prefix.len() >= 8 {
        header[i] = prefix[i - 76];
    }
}

/// Entropy coding context of byte `i` of the predicted stream, given the
/// two preceding bytes.
fn icc_context(i: usize, b1: u8, b2: u8) -> u32 {
    if i <= ICC_HEADER_SIZE {
        return 0;
    }
    1 + byte_class(b1) + 8 * byte_class(b2).min(4)
}

fn byte_class(b: u8) -> u32 {
    match b {
        0 => 0,
        1..=15 => 1,
        16..=31 => 2,
        b'A'..=b'Z' => 3,
        b'a'..=b'z' => 4,
        32..=127 => 5,
        128..=191 => 6,
        _ => 7,
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct TagEntry {
    keyword: Keyword,
    start: u64,
    size: u64,
}

fn parse_tag_table(icc: &[u8]) -> Option<Vec<TagEntry>> {
    if icc.len() < ICC_HEADER_SIZE + 4 {
        return None;
    }
    let numtags = u64::from(u32::from_be_bytes(
        icc[ICC_HEADER_SIZE..ICC_HEADER_SIZE + 4].try_into().unwrap(),
    ));
    let table_end = ICC_HEADER_SIZE as u64 + 4 + numtags * 12;
    if table_end > icc.len() as u64 {
        return None;
    }
    let mut entries = Vec::with_capacity(numtags as usize);
    for i in 0..numtags as usize {
        let at = ICC_HEADER_SIZE + 4 + i * 12;
        entries.push(TagEntry {
            keyword: icc[at..at + 4].try_into().unwrap(),
            start: u64::from(u32::from_be_bytes(icc[at + 4..at + 8].try_into().unwrap())),
            size: u64::from(u32::from_be_bytes(icc[at + 8..at + 12].try_into().unwrap())),
        });
    }
    Some(entries)
}

/// Approximate cost in bits of entropy coding one residual byte.
fn residual_cost(byte: u8) -> u32 {
    match byte {
        0 => 1,
        1..=15 | 241..=255 => 5,
        _ => 8,
    }
}

fn span_cost(bytes: impl Iterator<Item = u8>) -> u64 {
    bytes.map(|b| u64::from(residual_cost(b))).sum()
}

/// Encodes an arbitrary byte range as either a raw insert or a linear
/// prediction, whichever measures cheaper.
fn encode_span(icc: &[u8], a: usize, b: usize, commands: &mut Vec<u8>, data: &mut Vec<u8>) {
    let len = b - a;
    if len >= 16 {
        let insert_cost = span_cost(icc[a..b].iter().copied());
        let mut best: Option<(usize, usize, u64)> = None;
        for &(width, order) in &[(1usize, 1usize), (1, 2), (2, 1), (2, 2), (4, 1), (4, 2)] {
            let cost = span_cost(
                (0..len).map(|i| icc[a + i].wrapping_sub(linear_predict(icc, a, i, width, width, order))),
            );
            if best.is_none_or(|(_, _, c)| cost < c) {
                best = Some((width, order, cost));
            }
        }
        let (width, order, cost) = best.unwrap();
        // A prediction has to beat the raw bytes clearly to be worth its
        // command overhead.
        if cost * 8 < insert_cost * 7 {
            commands.push(CMD_PREDICT);
            commands.push((width - 1) as u8 | (order << 2) as u8);
            write_varint(commands, len as u64);
            let mut residuals: Vec<u8> = (0..len)
                .map(|i| icc[a + i].wrapping_sub(linear_predict(icc, a, i, width, width, order)))
                .collect();
            if width > 1 {
                unshuffle(&mut residuals, width);
            }
            data.extend_from_slice(&residuals);
            return;
        }
    }
    commands.push(CMD_INSERT);
    write_varint(commands, len as u64);
    data.extend_from_slice(&icc[a..b]);
}

/// Encodes one tag-data region, recognizing XYZ numbers and known type
/// keywords before falling back to [`encode_span`].
fn encode_region(icc: &[u8], a: usize, b: usize, commands: &mut Vec<u8>, data: &mut Vec<u8>) {
    let len = b - a;
    if len == 20 && icc[a..a + 4] == *b"XYZ " && icc[a + 4..a + 8] == [0; 4] {
        commands.push(CMD_XYZ);
        data.extend_from_slice(&icc[a + 8..a + 20]);
        return;
    }
    if len >= 8 && icc[a + 4..a + 8] == [0; 4] {
        if let Some(idx) = TYPE_STRINGS.iter().position(|t| *t == icc[a..a + 4]) {
            commands.push(CMD_TYPE_START + idx as u8);
            if len > 8 {
                encode_span(icc, a + 8, b, commands, data);
            }
            return;
        }
    }
    encode_span(icc, a, b, commands, data);
}

fn encode_tag_list(
    icc: &[u8],
    entries: &[TagEntry],
    commands: &mut Vec<u8>,
    data: &mut Vec<u8>,
) -> Result<()> {
    write_varint(commands, entries.len() as u64 + 1);
    let mut prevtagstart = ICC_HEADER_SIZE as u64 + entries.len() as u64 * 12;
    let mut prevtagsize = 0u64;
    let mut i = 0;
    while i < entries.len() {
        let entry = entries[i];
        let mut consumed = 1;
        let tagcode = if entry.keyword == TAG_RTRC
            && i + 2 < entries.len()
            && entries[i + 1].keyword == TAG_GTRC
            && entries[i + 2].keyword == TAG_BTRC
            && entries[i + 1].start == entry.start
            && entries[i + 2].start == entry.start
            && entries[i + 1].size == entry.size
            && entries[i + 2].size == entry.size
        {
            consumed = 3;
            CMD_TAG_TRC
        } else if entry.keyword == TAG_RXYZ
            && i + 2 < entries.len()
            && entries[i + 1].keyword == TAG_GXYZ
            && entries[i + 2].keyword == TAG_BXYZ
            && entries[i + 1].start == entry.start + entry.size
            && entries[i + 2].start == entry.start + entry.size * 2
            && entries[i + 1].size == entry.size
            && entries[i + 2].size == entry.size
        {
            consumed = 3;
            CMD_TAG_XYZ
        } else if let Some(idx) = TAG_STRINGS.iter().position(|t| *t == entry.keyword) {
            CMD_TAG_STRING_FIRST + idx as u8
        } else {
            CMD_TAG_UNKNOWN
        };

        let expected_size = if SIZE_20_TAGS.contains(&entry.keyword) {
            20
        } else {
            prevtagsize
        };
        let mut command = tagcode;
        if entry.start != prevtagstart + prevtagsize {
            command |= FLAG_OFFSET;
        }
        if entry.size != expected_size {
            command |= FLAG_SIZE;
        }
        commands.push(command);
        if tagcode == CMD_TAG_UNKNOWN {
            append_keyword(data, entry.keyword);
        }
        if command & FLAG_OFFSET != 0 {
            write_varint(commands, entry.start);
        }
        if command & FLAG_SIZE != 0 {
            write_varint(commands, entry.size);
        }
        prevtagstart = entry.start;
        prevtagsize = entry.size;
        i += consumed;
    }
    // Terminate the tag list so the main content commands that follow are
    // not mistaken for tag commands.
    commands.push(0);
    Ok(())
}

/// Applies the predictive transform, producing the commands+data byte
/// stream that [`unpredict_icc`] inverts.
pub fn predict_icc(icc: &[u8]) -> Result<Vec<u8>> {
    let osize = icc.len() as u64;
    if osize > MAX_ICC_SIZE {
        return Err(Error::IccLimitExceeded("profile too large"));
    }
    let mut commands = Vec::new();
    let mut data = Vec::new();

    // Header bytes become residuals against the fixed prediction.
    let mut header = initial_header_prediction(osize);
    let header_len = icc.len().min(ICC_HEADER_SIZE);
    for i in 0..header_len {
        predict_header(&icc[..i], &mut header, i);
        data.push(icc[i].wrapping_sub(header[i]));
    }

    if icc.len() > ICC_HEADER_SIZE {
        let entries = parse_tag_table(icc);
        let main_start = match &entries {
            Some(entries) => {
                encode_tag_list(icc, entries, &mut commands, &mut data)?;
                ICC_HEADER_SIZE + 4 + entries.len() * 12
            }
            None => {
                write_varint(&mut commands, 0);
                ICC_HEADER_SIZE
            }
        };

        // Tag data regions in stream order; overlapping or shared regions
        // collapse into whatever span covers them first.
        let mut regions: Vec<(usize, usize)> = entries
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .filter(|e| e.start >= main_start as u64 && e.start + e.size <= osize)
            .map(|e| (e.start as usize, (e.start + e.size) as usize))
            .collect();
        regions.sort_unstable();

        let mut pos = main_start;
        for (start, end) in regions {
            if start < pos {
                continue;
            }
            if start > pos {
                encode_span(icc, pos, start, &mut commands, &mut data);
            }
            encode_region(icc, start, end, &mut commands, &mut data);
            pos = end;
        }
        if pos < icc.len() {
            encode_span(icc, pos, icc.len(), &mut commands, &mut data);
        }
    }

    let mut out = Vec::with_capacity(commands.len() + data.len() + 8);
    write_varint(&mut out, osize);
    write_varint(&mut out, commands.len() as u64);
    out.extend_from_slice(&commands);
    out.extend_from_slice(&data);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Validates the first bytes of a predicted stream before committing to a
/// full decode.
fn check_preamble(data: &[u8], enc_size: u64) -> Result<()> {
    let mut pos = 0;
    let osize = read_varint(data, &mut pos, data.len())?;
    if osize > MAX_ICC_SIZE {
        return Err(Error::IccLimitExceeded("declared profile too large"));
    }
    let csize = read_varint(data, &mut pos, data.len())?;
    if csize > u64::from(u32::MAX) || pos as u64 + csize > enc_size {
        return Err(Error::IccInconsistent("commands stream out of bounds"));
    }
    // The transform inflates its input; the reverse direction is a bomb.
    if osize + MAX_ICC_EXPANSION < enc_size {
        return Err(Error::IccLimitExceeded("encoded size exceeds declared size"));
    }
    Ok(())
}

/// Decodes the result of [`predict_icc`] back to the original profile
/// bytes.
pub fn unpredict_icc(enc: &[u8]) -> Result<Vec<u8>> {
    let size = enc.len();
    check_preamble(enc, size as u64)?;
    let mut pos = 0;
    let osize = read_varint(enc, &mut pos, size)? as usize;
    let csize = read_varint(enc, &mut pos, size)? as usize;
    let mut cpos = pos;
    let commands_end = cpos + csize;
    pos = commands_end;

    let mut result: Vec<u8> = Vec::with_capacity(osize.min(1 << 20));
    let mut header = initial_header_prediction(osize as u64);
    for i in 0..=ICC_HEADER_SIZE {
        if result.len() == osize {
            if cpos != commands_end {
                return Err(Error::IccInconsistent("not all commands used"));
            }
            if pos != size {
                return Err(Error::IccInconsistent("not all data used"));
            }
            return Ok(result);
        }
        if i == ICC_HEADER_SIZE {
            break;
        }
        predict_header(&result, &mut header, i);
        if pos >= size {
            return Err(Error::IccInconsistent("data stream out of bounds"));
        }
        result.push(enc[pos].wrapping_add(header[i]));
        pos += 1;
    }
    if cpos >= commands_end {
        return Err(Error::IccInconsistent("commands stream out of bounds"));
    }

    // Tag list.
    let numtags = read_varint(enc, &mut cpos, commands_end)?;
    if numtags != 0 {
        let numtags = numtags - 1;
        if numtags > u64::from(u32::MAX) {
            return Err(Error::IccInconsistent("tag count does not fit 32 bits"));
        }
        append_u32(&mut result, numtags)?;
        let mut prevtagstart = ICC_HEADER_SIZE as u64 + numtags * 12;
        let mut prevtagsize = 0u64;
        loop {
            if result.len() > osize {
                return Err(Error::IccInconsistent("output exceeds declared size"));
            }
            if cpos == commands_end {
                break;
            }
            let command = enc[cpos];
            cpos += 1;
            let tagcode = command & 63;
            let tag = match tagcode {
                0 => break,
                CMD_TAG_UNKNOWN => {
                    if pos + 4 > size {
                        return Err(Error::IccInconsistent("data stream out of bounds"));
                    }
                    let keyword: Keyword = enc[pos..pos + 4].try_into().unwrap();
                    pos += 4;
                    keyword
                }
                CMD_TAG_TRC => TAG_RTRC,
                CMD_TAG_XYZ => TAG_RXYZ,
                _ => {
                    let idx = usize::from(tagcode - CMD_TAG_STRING_FIRST);
                    if idx >= TAG_STRINGS.len() {
                        return Err(Error::IccInconsistent("unknown tag command"));
                    }
                    TAG_STRINGS[idx]
                }
            };
            append_keyword(&mut result, tag);

            let mut tagsize = if SIZE_20_TAGS.contains(&tag) {
                20
            } else {
                prevtagsize
            };
            let tagstart = if command & FLAG_OFFSET != 0 {
                read_varint(enc, &mut cpos, commands_end)?
            } else {
                prevtagstart + prevtagsize
            };
            append_u32(&mut result, tagstart)?;
            if command & FLAG_SIZE != 0 {
                tagsize = read_varint(enc, &mut cpos, commands_end)?;
            }
            append_u32(&mut result, tagsize)?;
            prevtagstart = tagstart;
            prevtagsize = tagsize;

            if tagcode == CMD_TAG_TRC {
                for keyword in [TAG_GTRC, TAG_BTRC] {
                    append_keyword(&mut result, keyword);
                    append_u32(&mut result, tagstart)?;
                    append_u32(&mut result, tagsize)?;
                }
            }
            if tagcode == CMD_TAG_XYZ {
                append_keyword(&mut result, TAG_GXYZ);
                append_u32(&mut result, tagstart + tagsize)?;
                append_u32(&mut result, tagsize)?;
                append_keyword(&mut result, TAG_BXYZ);
                append_u32(&mut result, tagstart + tagsize * 2)?;
                append_u32(&mut result, tagsize)?;
            }
        }
    }

    // Main content.
    loop {
        if result.len() > osize {
            return Err(Error::IccInconsistent("output exceeds declared size"));
        }
        if cpos == commands_end {
            break;
        }
        let command = enc[cpos];
        cpos += 1;
        match command {
            CMD_INSERT => {
                let num = read_varint(enc, &mut cpos, commands_end)?;
                let bytes = take_bytes(enc, &mut pos, num)?;
                result.extend_from_slice(bytes);
            }
            CMD_SHUFFLE2 | CMD_SHUFFLE4 => {
                let num = read_varint(enc, &mut cpos, commands_end)?;
                let mut shuffled = take_bytes(enc, &mut pos, num)?.to_vec();
                shuffle(&mut shuffled, if command == CMD_SHUFFLE2 { 2 } else { 4 });
                result.extend_from_slice(&shuffled);
            }
            CMD_PREDICT => {
                if cpos >= commands_end {
                    return Err(Error::IccInconsistent("commands stream out of bounds"));
                }
                let flags = enc[cpos];
                cpos += 1;
                let width = usize::from(flags & 3) + 1;
                if width == 3 {
                    return Err(Error::IccLimitExceeded("invalid predictor width"));
                }
                let order = usize::from(flags & 12) >> 2;
                if order == 3 {
                    return Err(Error::IccLimitExceeded("invalid predictor order"));
                }
                let mut stride = width as u64;
                if flags & 16 != 0 {
                    stride = read_varint(enc, &mut cpos, commands_end)?;
                    if stride < width as u64 {
                        return Err(Error::IccLimitExceeded("invalid predictor stride"));
                    }
                }
                if result.is_empty() || ((result.len() as u64 - 1) >> 2) < stride {
                    return Err(Error::IccLimitExceeded("invalid predictor stride"));
                }
                let stride = stride as usize;

                let num = read_varint(enc, &mut cpos, commands_end)?;
                let mut residuals = take_bytes(enc, &mut pos, num)?.to_vec();
                if width > 1 {
                    shuffle(&mut residuals, width);
                }
                let start = result.len();
                for (i, &residual) in residuals.iter().enumerate() {
                    let predicted = linear_predict(&result, start, i, stride, width, order);
                    result.push(predicted.wrapping_add(residual));
                }
            }
            CMD_XYZ => {
                append_keyword(&mut result, *b"XYZ ");
                result.extend_from_slice(&[0; 4]);
                if pos + 12 > size {
                    return Err(Error::IccInconsistent("data stream out of bounds"));
                }
                result.extend_from_slice(&enc[pos..pos + 12]);
                pos += 12;
            }
            _ => {
                let idx = usize::from(command.wrapping_sub(CMD_TYPE_START));
                if command < CMD_TYPE_START || idx >= TYPE_STRINGS.len() {
                    return Err(Error::IccInconsistent("unknown command"));
                }
                append_keyword(&mut result, TYPE_STRINGS[idx]);
                result.extend_from_slice(&[0; 4]);
            }
        }
    }

    if pos != size {
        return Err(Error::IccInconsistent("not all data used"));
    }
    if result.len() != osize {
        return Err(Error::IccInconsistent("output does not match declared size"));
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Bit-stream framing and the resumable reader
// ---------------------------------------------------------------------------

/// Writes a length as a 6-bit bit-width followed by that many payload
/// bits.
fn write_u64(writer: &mut BitWriter, value: u64) {
    let width = (64 - value.leading_zeros()) as usize;
    writer.write(6, width as u64);
    if width > 0 {
        writer.write(width, value);
    }
}

fn read_u64(reader: &mut BitReader<'_>) -> u64 {
    let width = reader.read(6) as usize;
    if width == 0 {
        0
    } else {
        reader.read(width)
    }
}

/// Entropy codes an ICC profile into `writer`: the predicted stream
/// length, then the shared histograms, then the stream bytes as context
/// modeled symbols.
pub fn write_icc(icc: &[u8], writer: &mut BitWriter) -> Result<()> {
    let enc = predict_icc(icc)?;
    write_u64(writer, enc.len() as u64);
    let tokens: Vec<Token> = enc
        .iter()
        .enumerate()
        .map(|(i, &byte)| {
            let b1 = if i >= 1 { enc[i - 1] } else { 0 };
            let b2 = if i >= 2 { enc[i - 2] } else { 0 };
            Token::new(icc_context(i, b1, b2), u32::from(byte))
        })
        .collect();
    let (codes, context_map) =
        build_and_encode_histograms(NUM_ICC_CONTEXTS, std::slice::from_ref(&tokens), writer);
    write_tokens(&tokens, &codes, &context_map, writer);
    Ok(())
}

/// How far the preamble validation looks into the predicted stream; enough
/// for two maximal varints.
const PREAMBLE_SIZE: usize = 22;

fn check_eoi(reader: &BitReader<'_>) -> Result<()> {
    if reader.all_reads_within_bounds() {
        Ok(())
    } else {
        Err(Error::NotEnoughBytes)
    }
}

/// Resumable decoder for an entropy coded ICC profile.
///
/// Feed it a [`BitReader`] positioned at the start of the ICC stream. When
/// [`IccReader::process`] returns [`Error::NotEnoughBytes`], the decode is
/// suspended at the last checkpoint: call `process` again with a reader
/// over the same stream start but with more bytes, and it resumes where it
/// left off. Any other error is fatal.
#[derive(Debug, Default)]
pub struct IccReader {
    budget: MemoryBudget,
    initialized: bool,
    enc_size: u64,
    code: Option<AnsCode>,
    context_map: Vec<u8>,
    decompressed: Vec<u8>,
    /// Symbols decoded as of the last checkpoint.
    committed: usize,
    checkpoint: Option<AnsCheckpoint>,
    used_bits_base: u64,
    /// Bits consumed from the stream start as of the last checkpoint.
    bits_to_skip: u64,
}

impl IccReader {
    /// Creates a reader with the default memory budget.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a reader charging the given budget.
    #[must_use]
    pub fn with_budget(budget: MemoryBudget) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    fn init(&mut self, reader: &mut BitReader<'_>) -> Result<()> {
        if self.initialized {
            reader.skip(self.bits_to_skip);
            return Ok(());
        }
        self.used_bits_base = reader.total_bits_consumed();
        self.enc_size = read_u64(reader);
        check_eoi(reader)?;
        if self.enc_size > MAX_ICC_SIZE {
            return Err(Error::IccLimitExceeded("encoded profile too large"));
        }
        let mut budget = self.budget.clone();
        budget.charge(self.enc_size as usize)?;
        let (code, context_map) =
            decode_histograms(reader, NUM_ICC_CONTEXTS, 256, &mut budget)?;

        let mut ans = AnsReader::new(&code, reader);
        let mut decompressed = Vec::with_capacity(PREAMBLE_SIZE);
        while decompressed.len() < (self.enc_size as usize).min(PREAMBLE_SIZE) {
            let i = decompressed.len();
            let b1 = if i >= 1 { decompressed[i - 1] } else { 0 };
            let b2 = if i >= 2 { decompressed[i - 2] } else { 0 };
            let symbol = ans.read_symbol(context_map[icc_context(i, b1, b2) as usize], reader);
            decompressed.push(symbol as u8);
        }
        check_eoi(reader)?;
        if self.enc_size as usize > PREAMBLE_SIZE {
            check_preamble(&decompressed, self.enc_size)?;
        }

        // Commit: everything before this point is re-run from scratch when
        // the stream was too short.
        self.budget = budget;
        self.checkpoint = Some(ans.save());
        self.code = Some(code);
        self.context_map = context_map;
        self.decompressed = decompressed;
        self.committed = self.decompressed.len();
        self.bits_to_skip = reader.total_bits_consumed() - self.used_bits_base;
        self.initialized = true;
        Ok(())
    }

    /// Runs the decode forward, filling `out` with the reconstructed
    /// profile on completion.
    ///
    /// Returns `Err(NotEnoughBytes)` when the input ran dry; state is kept
    /// so a later call can resume.
    pub fn process(&mut self, reader: &mut BitReader<'_>, out: &mut Vec<u8>) -> Result<()> {
        check_eoi(reader)?;
        self.init(reader)?;
        let code = self.code.as_ref().expect("initialized");
        let mut ans = AnsReader::resume(code, self.checkpoint.expect("initialized"));
        let enc_size = self.enc_size as usize;

        let mut i = self.committed;
        self.decompressed.truncate(i);
        while i < enc_size {
            if i > 0 && i % MAX_CHECKPOINT_INTERVAL == 0 {
                if !reader.all_reads_within_bounds() {
                    // Roll back to the checkpoint; the caller re-feeds the
                    // stream with more bytes and we skip back to here.
                    self.decompressed.truncate(self.committed);
                    return Err(Error::NotEnoughBytes);
                }
                self.checkpoint = Some(ans.save());
                self.committed = i;
                self.bits_to_skip = reader.total_bits_consumed() - self.used_bits_base;
                if i % 65536 == 0 {
                    let used_bytes = (reader.total_bits_consumed() - self.used_bits_base) / 8;
                    if i as u64 > used_bytes * 256 {
                        return Err(Error::IccInconsistent("stream decompresses too fast"));
                    }
                }
            }
            let b1 = self.decompressed[i - 1];
            let b2 = if i >= 2 { self.decompressed[i - 2] } else { 0 };
            let symbol = ans.read_symbol(
                self.context_map[icc_context(i, b1, b2) as usize],
                reader,
            );
            self.decompressed.push(symbol as u8);
            i += 1;
        }
        if !reader.all_reads_within_bounds() {
            self.decompressed.truncate(self.committed);
            return Err(Error::NotEnoughBytes);
        }
        self.checkpoint = Some(ans.save());
        self.committed = i;
        self.bits_to_skip = reader.total_bits_consumed() - self.used_bits_base;
        if !ans.check_final_state() {
            return Err(Error::AnsFinalStateMismatch);
        }

        *out = unpredict_icc(&self.decompressed)?;
        Ok(())
    }
}

/// One-shot decode of an entropy coded ICC profile.
pub fn read_icc(reader: &mut BitReader<'_>) -> Result<Vec<u8>> {
    let mut icc_reader = IccReader::new();
    let mut out = Vec::new();
    icc_reader.process(reader, &mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_round_trip(icc: &[u8]) {
        let enc = predict_icc(icc).unwrap();
        assert_eq!(unpredict_icc(&enc).unwrap(), icc);
    }

    #[test]
    fn test_varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert!(buf.len() <= 10);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos, buf.len()).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_shuffle_interleaves() {
        let mut data = *b"ABCDabcd";
        shuffle(&mut data, 2);
        assert_eq!(&data, b"AaBbCcDd");
        unshuffle(&mut data, 2);
        assert_eq!(&data, b"ABCDabcd");
    }

    #[test]
    fn test_shuffle_uneven_length() {
        for len in [1usize, 3, 5, 7, 9, 17] {
            for width in [2usize, 4] {
                let original: Vec<u8> = (0..len as u8).collect();
                let mut data = original.clone();
                shuffle(&mut data, width);
                unshuffle(&mut data, width);
                assert_eq!(data, original);
            }
        }
    }

    #[test]
    fn test_tiny_profiles_round_trip() {
        byte_round_trip(&[]);
        byte_round_trip(&[0x42]);
        let hundred: Vec<u8> = (0..100u8).collect();
        byte_round_trip(&hundred);
    }

    #[test]
    fn test_exact_header_size_profile() {
        let profile: Vec<u8> = (0..128u8).collect();
        byte_round_trip(&profile);
    }

    #[test]
    fn test_headerless_blob_round_trip() {
        // No valid tag table; everything past the header goes through the
        // generic span coder.
        let blob: Vec<u8> = (0..10_000u32).map(|i| (i * 17 % 251) as u8).collect();
        byte_round_trip(&blob);
    }

    #[test]
    fn test_predictable_body_uses_predict() {
        // A smooth 16-bit ramp after the header is exactly what the
        // order-2 width-2 predictor eats.
        let mut profile = vec![0u8; 128];
        for i in 0..1000u16 {
            profile.extend_from_slice(&(i * 3).to_be_bytes());
        }
        let enc = predict_icc(&profile).unwrap();
        assert_eq!(unpredict_icc(&enc).unwrap(), profile);
        // The transform itself does not shrink anything; it exposes the
        // structure as near-zero residuals for the entropy coder.
        let zeros = enc.iter().filter(|&&b| b == 0).count();
        assert!(zeros * 4 > enc.len() * 3, "ramp should predict to zeros");
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut enc = Vec::new();
        write_varint(&mut enc, 200); // osize
        write_varint(&mut enc, 2); // csize
        enc.push(0); // empty tag list
        enc.push(9); // not a valid main-content command
        enc.extend_from_slice(&[0u8; 128]);
        assert_eq!(
            unpredict_icc(&enc),
            Err(Error::IccInconsistent("unknown command"))
        );
    }

    #[test]
    fn test_oversized_declared_size_rejected() {
        let mut enc = Vec::new();
        write_varint(&mut enc, MAX_ICC_SIZE + 1);
        write_varint(&mut enc, 0);
        assert_eq!(
            unpredict_icc(&enc),
            Err(Error::IccLimitExceeded("declared profile too large"))
        );
    }

    #[test]
    fn test_expansion_bomb_rejected() {
        // An encoded stream much larger than the declared output.
        let icc = vec![7u8; 16];
        let mut enc = predict_icc(&icc).unwrap();
        let padding = (MAX_ICC_EXPANSION as usize + 1).saturating_sub(enc.len() - icc.len());
        enc.extend(std::iter::repeat_n(0u8, padding));
        assert!(matches!(
            unpredict_icc(&enc),
            Err(Error::IccLimitExceeded(_))
        ));
    }

    #[test]
    fn test_bit_stream_round_trip() {
        let profile: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        let mut writer = BitWriter::new();
        write_icc(&profile, &mut writer).unwrap();
        writer.zero_pad_to_byte();
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        let decoded = read_icc(&mut reader).unwrap();
        reader.close().unwrap();
        assert_eq!(decoded, profile);
    }
}
