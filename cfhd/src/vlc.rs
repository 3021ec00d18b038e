//! Variable length coding of quantized coefficients.
//!
//! A quantized two-dimensional subband is serialized as a stream of
//! run length and value atoms: each atom is either a run of zero
//! coefficients or a single signed value that advances the scan by one
//! column. The stream is terminated by the reserved band-end codeword
//! and padded to the next tag boundary.
//!
//! Decoding uses the fast lookup table front end with the sign folded
//! into the table entries; codewords longer than the table window fall
//! back to a linear codebook search that reads the sign bit after the
//! magnitude. The two paths belong to the same codeset and are never
//! mixed per band in any other combination.

use bitstream::{BitReader, BitWriter};
use log::debug;

use crate::codebook::{
    Codebooks, Vlc, BAND_END_CODE, BAND_END_SIZE, FAST_TABLE_BITS, MAX_MAGNITUDE, RUN_TABLE_MAX,
    VLC_NEGATIVE_CODE, VLC_POSITIVE_CODE, VLC_SIGN_SIZE,
};
use crate::{CodecError, Tag};

/// A run of zeros followed by a signed value decoded from the stream.
///
/// A pure run has `value == 0`; a value atom has `count == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub count: u32,
    pub value: i32,
}

/// Position of the scan within one band row.
#[derive(Debug, Clone, Copy)]
pub struct RunState {
    pub column: usize,
    pub width: usize,
    pub value: i32,
}

/// One decoded codeword from the run/value codeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlvCode {
    Atom(Run),
    BandEnd,
}

/// Output the variable length code for a single non-negative value.
///
/// Values beyond the range of the codebook saturate to the largest
/// entry; the stream counts the saturated values.
pub fn put_vlc(stream: &mut BitWriter, value: i32, codebook: &[Vlc]) {
    let maximum_value = codebook.len() as i32 - 1;

    let mut value = value;
    if value > maximum_value {
        value = maximum_value;
        stream.count_saturated();
    }

    let code = codebook[value as usize];
    stream.put_bits(code.bits, code.size);
}

/// Output the code for the magnitude of a value followed by the sign.
pub fn put_vlc_signed(stream: &mut BitWriter, value: i32, codebook: &[Vlc]) {
    let mut magnitude = value.abs();
    let maximum_value = codebook.len() as i32 - 1;

    if magnitude > maximum_value {
        magnitude = maximum_value;
        stream.count_saturated();
    }

    let code = codebook[magnitude as usize];
    let mut bits = code.bits;
    let mut size = code.size;

    // Combine the magnitude and sign into a single codeword
    if value != 0 {
        bits <<= VLC_SIGN_SIZE;
        if value < 0 {
            bits |= VLC_NEGATIVE_CODE;
        }
        size += VLC_SIGN_SIZE;
    }

    stream.put_bits(bits, size);
}

/// Get the value corresponding to a variable length code by linear
/// search through the codebook.
pub fn get_vlc(stream: &mut BitReader, codebook: &[Vlc]) -> Result<i32, CodecError> {
    let mut size = 0;
    let mut bits = 0;

    for (value, code) in codebook.iter().enumerate() {
        if size < code.size {
            bits = stream.add_bits(bits, code.size - size);
            size = code.size;
            crate::check_stream(stream)?;
        }

        if bits == code.bits {
            return Ok(value as i32);
        }
    }

    Err(CodecError::UnmatchedCode)
}

/// Get a signed quantity from the bitstream.
pub fn get_vlc_signed(stream: &mut BitReader, codebook: &[Vlc]) -> Result<i32, CodecError> {
    let mut value = get_vlc(stream, codebook)?;

    // Signed quantity?
    if value != 0 {
        let sign = stream.get_bits(VLC_SIGN_SIZE);
        crate::check_stream(stream)?;
        if sign == VLC_NEGATIVE_CODE {
            value = -value;
        }
    }

    Ok(value)
}

/// Output run length codes covering a run of zeros.
///
/// The expanded run table is scanned greedily from the largest run
/// that fits. The output is unambiguous because no run code is a
/// prefix of any other codeword.
pub fn put_zero_run(stream: &mut BitWriter, count: usize, books: &Codebooks) {
    let mut count = count;

    while count > 0 {
        let index = count.min(RUN_TABLE_MAX);
        let entry = books.run_table[index];

        stream.put_bits(entry.bits, entry.size);
        count -= entry.count as usize;
    }
}

/// Output the codeword for one signed coefficient.
///
/// Values within the indexed value book are emitted by direct lookup;
/// larger values take the codebook path and saturate to the largest
/// magnitude in the book.
pub fn put_rlv_value(stream: &mut BitWriter, value: i32, books: &Codebooks) {
    if value >= i8::MIN as i32 && value <= i8::MAX as i32 {
        // Convert the value to an unsigned byte index into the book
        let index = value as i8 as u8 as usize;
        let code = books.value_book[index];
        stream.put_bits(code.bits, code.size);
        return;
    }

    let mut magnitude = value.unsigned_abs();
    if magnitude > MAX_MAGNITUDE {
        magnitude = MAX_MAGNITUDE;
        stream.count_saturated();
    }

    let code = crate::codebook::magnitude_code(magnitude)
        .expect("the codebook covers every magnitude up to the maximum");
    let sign = if value < 0 {
        VLC_NEGATIVE_CODE
    } else {
        VLC_POSITIVE_CODE
    };
    stream.put_bits((code.bits << VLC_SIGN_SIZE) | sign, code.size + VLC_SIGN_SIZE);
}

/// Append the band end codeword to the encoded coefficients.
pub fn put_band_end(stream: &mut BitWriter) {
    stream.put_bits(BAND_END_CODE, BAND_END_SIZE);
}

// Search the codebook for the next codeword starting at the given
// entry, reading successively more bits as the codeword size grows.
fn search_rlv(
    stream: &mut BitReader,
    books: &Codebooks,
    start: usize,
) -> Result<RlvCode, CodecError> {
    let book = &books.rlv_book;
    let mut size = 0;
    let mut bits = 0;
    let mut index = start;

    while index < book.len() {
        let codesize = book[index].size;

        // The codebook entries are sorted into increasing codeword length
        debug_assert!(size <= codesize);

        if size < codesize {
            bits = stream.add_bits(bits, codesize - size);
            size = codesize;
            crate::check_stream(stream)?;
        }

        // Examine the entries that have the same bit field length
        while index < book.len() && book[index].size == size {
            if bits == book[index].bits {
                let entry = book[index];

                if entry.is_band_end() {
                    return Ok(RlvCode::BandEnd);
                }

                let mut value = entry.value as i32;
                if value != 0 {
                    // The search path reads the sign after the magnitude
                    let sign = stream.get_bits(VLC_SIGN_SIZE);
                    crate::check_stream(stream)?;
                    if sign == VLC_NEGATIVE_CODE {
                        value = -value;
                    }
                }

                return Ok(RlvCode::Atom(Run {
                    count: entry.count,
                    value,
                }));
            }
            index += 1;
        }
    }

    // Did not find a matching code in the codebook
    Err(CodecError::UnmatchedCode)
}

/// Decode the next run length and value atom from the stream.
pub fn lookup_rlv(stream: &mut BitReader, books: &Codebooks) -> Result<RlvCode, CodecError> {
    let index = stream.peek_bits(FAST_TABLE_BITS) as usize;
    let entry = books.fast_table[index];

    if entry.count > 0 {
        // The sign decoding is embedded in the table entry
        stream.skip_bits(entry.shift as u32);
        crate::check_stream(stream)?;
        return Ok(RlvCode::Atom(Run {
            count: entry.count as u32,
            value: entry.value as i32,
        }));
    }

    // Search the codebook starting at the index from the lookup table
    search_rlv(stream, books, entry.value as usize)
}

/// Skip runs of zeros and find the next signed value in one band row.
///
/// The run state records the position within the row so that the scan
/// does not search past the end of the row. Returns false if the band
/// end codeword was encountered instead of a data atom.
pub fn scan_rlv_row(
    stream: &mut BitReader,
    books: &Codebooks,
    scan: &mut RunState,
) -> Result<bool, CodecError> {
    scan.value = 0;

    // Do not read values or runs past the end of the row
    while scan.column < scan.width && scan.value == 0 {
        match lookup_rlv(stream, books)? {
            RlvCode::BandEnd => return Ok(false),
            RlvCode::Atom(run) => {
                scan.column += run.count as usize;
                scan.value = run.value;
            }
        }
    }

    Ok(true)
}

/// Encode a quantized band as runs and values in raster order.
///
/// Runs of zeros continue across row boundaries. The trailing run is
/// flushed before the band end codeword so the decoder's cursor lands
/// exactly on the end of the band.
pub fn encode_band(
    stream: &mut BitWriter,
    books: &Codebooks,
    data: &[i16],
    width: usize,
    height: usize,
    pitch: usize,
) {
    let mut zero_run = 0usize;

    for row in 0..height {
        let line = &data[row * pitch..row * pitch + width];
        for &coefficient in line {
            if coefficient == 0 {
                zero_run += 1;
            } else {
                if zero_run > 0 {
                    put_zero_run(stream, zero_run, books);
                    zero_run = 0;
                }
                put_rlv_value(stream, coefficient as i32, books);
            }
        }
    }

    if zero_run > 0 {
        put_zero_run(stream, zero_run, books);
    }

    put_band_end(stream);
}

/// Decode the coefficients of one band up to the band end codeword.
///
/// The band buffer must be zeroed; only non-zero coefficients are
/// written. Runs read from the stream may span row boundaries.
pub fn decode_band(
    stream: &mut BitReader,
    books: &Codebooks,
    data: &mut [i16],
    width: usize,
    height: usize,
    pitch: usize,
) -> Result<(), CodecError> {
    let mut carry = 0usize;
    let mut band_end = false;

    for row in 0..height {
        let mut scan = RunState {
            column: carry,
            width,
            value: 0,
        };

        while scan.column < scan.width {
            if !scan_rlv_row(stream, books, &mut scan)? {
                band_end = true;
                break;
            }
            if scan.value != 0 {
                let column = scan.column - 1;
                if column < width {
                    data[row * pitch + column] = scan.value as i16;
                }
            }
        }

        if band_end {
            debug!("band end before row {} of {}", row, height);
            break;
        }

        carry = scan.column - width;
    }

    // Consume the band end codeword, accepting any padding runs that
    // cover coefficients beyond the last row
    while !band_end {
        match lookup_rlv(stream, books)? {
            RlvCode::BandEnd => band_end = true,
            RlvCode::Atom(run) if run.value == 0 => continue,
            RlvCode::Atom(_) => {
                return Err(CodecError::MissingMarker {
                    tag: Tag::BandTrailer.value(),
                });
            }
        }
    }

    Ok(())
}
