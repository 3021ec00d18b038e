//! Quantization of highpass coefficients and the prescale tables.
//!
//! Each highpass band has a scalar divisor of at least one. The
//! encoder applies uniform midtread quantization with an optional
//! midpoint bias; dequantization multiplies back without rounding, so
//! quantization is the only lossy step. Lowpass bands are never
//! quantized.
//!
//! The prescale table records the right shift applied to each
//! wavelet's input before filtering, sized to keep the sum-form
//! lowpass band within sixteen bits. The table packs two bits per
//! wavelet into one tag value, wavelet zero in the top bits.

use crate::wavelet::TransformType;
use crate::MAX_WAVELETS;

/// Largest shift representable in the packed prescale table.
pub const PRESCALE_MAX_SHIFT: u32 = 3;

/// The midpoint added before division for the configured denominator.
///
/// A denominator of zero selects strict floor quantization; values of
/// two through eight bias the threshold to `divisor / denominator`.
pub fn quantization_midpoint(divisor: i32, denominator: u16) -> i32 {
    if (2..=8).contains(&denominator) {
        divisor / denominator as i32
    } else {
        0
    }
}

/// Quantize a single coefficient.
#[inline]
pub fn quantize(value: i32, divisor: i32, midpoint: i32) -> i32 {
    if divisor <= 1 {
        return value;
    }
    let magnitude = (value.abs() + midpoint) / divisor;
    if value < 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Restore the coefficient range; the rounding error introduced by
/// quantization is not recoverable.
#[inline]
pub fn dequantize(value: i32, divisor: i32) -> i32 {
    value * divisor
}

/// Quantize a band in place.
pub fn quantize_band(
    data: &mut [i16],
    width: usize,
    height: usize,
    pitch: usize,
    divisor: u16,
    midpoint_denominator: u16,
) {
    if divisor <= 1 {
        return;
    }

    let divisor = divisor as i32;
    let midpoint = quantization_midpoint(divisor, midpoint_denominator);

    for row in 0..height {
        for value in &mut data[row * pitch..row * pitch + width] {
            *value = quantize(*value as i32, divisor, midpoint) as i16;
        }
    }
}

/// Dequantize a band in place.
pub fn dequantize_band(data: &mut [i16], width: usize, height: usize, pitch: usize, divisor: u16) {
    if divisor <= 1 {
        return;
    }

    let divisor = divisor as i32;
    for row in 0..height {
        for value in &mut data[row * pitch..row * pitch + width] {
            *value = crate::filter::saturate16(dequantize(*value as i32, divisor));
        }
    }
}

// Divisors per subband slot for each quality bucket. Subband zero is
// the apex lowpass band and is never quantized; the deeper subbands
// (later slots) sit closer to the apex and receive smaller divisors.
const QUANT_TABLE: [[u16; 17]; 6] = [
    // Low
    [1, 24, 24, 32, 24, 24, 32, 12, 16, 16, 20, 12, 12, 16, 6, 6, 8],
    // Medium
    [1, 12, 12, 16, 12, 12, 16, 6, 8, 8, 10, 6, 6, 8, 4, 4, 4],
    // High
    [1, 6, 6, 8, 6, 6, 8, 4, 4, 4, 5, 3, 3, 4, 2, 2, 2],
    // Film scan 1
    [1, 4, 4, 4, 4, 4, 4, 2, 2, 2, 3, 2, 2, 2, 1, 1, 1],
    // Film scan 2
    [1, 2, 2, 2, 2, 2, 2, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1],
    // Uncompressed quantizers
    [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
];

/// Number of quality buckets in the quantizer table.
pub const QUALITY_LEVELS: u32 = QUANT_TABLE.len() as u32;

/// Select the quantization divisor for one subband from the 32-bit
/// quality code. The low half of the code is the quality bucket.
pub fn quantizer_for_subband(quality: u32, subband: usize) -> u16 {
    let bucket = (quality & 0xFFFF).min(QUALITY_LEVELS - 1) as usize;
    let slot = subband.min(QUANT_TABLE[bucket].len() - 1);
    QUANT_TABLE[bucket][slot]
}

/// The default prescale shifts for the transform organisation and the
/// input precision.
///
/// The shifts keep the cumulative amplitude expansion of the pyramid
/// within the signed 16-bit band range: every two-band filter doubles
/// the lowpass amplitude, so deeper inputs shed bits before filtering.
pub fn default_prescale(
    transform_type: TransformType,
    precision: usize,
) -> [u32; MAX_WAVELETS] {
    let mut prescale = [0u32; MAX_WAVELETS];

    let temporal_types = matches!(
        transform_type,
        TransformType::Field | TransformType::FieldPlus | TransformType::Frame
    );

    match precision {
        0..=8 => {}
        9..=10 => {
            prescale[0] = 2;
            if temporal_types {
                prescale[1] = 2;
            }
        }
        11..=12 => {
            prescale[0] = 2;
            prescale[1] = 2;
            if temporal_types {
                prescale[2] = 2;
            }
        }
        _ => {
            prescale[0] = 3;
            prescale[1] = 3;
            if temporal_types {
                prescale[2] = 3;
            }
        }
    }

    prescale
}

/// Pack the per-wavelet prescale shifts into one tag value, two bits
/// per wavelet with wavelet zero in the most significant position.
pub fn pack_prescale(prescale: &[u32; MAX_WAVELETS]) -> u16 {
    let mut packed = 0u16;
    for (index, &shift) in prescale.iter().enumerate() {
        let shift = shift.min(PRESCALE_MAX_SHIFT) as u16;
        packed |= shift << (14 - 2 * index);
    }
    packed
}

/// Unpack a prescale table tag value.
pub fn unpack_prescale(packed: u16) -> [u32; MAX_WAVELETS] {
    let mut prescale = [0u32; MAX_WAVELETS];
    for (index, shift) in prescale.iter_mut().enumerate() {
        *shift = ((packed >> (14 - 2 * index)) & 0x3) as u32;
    }
    prescale
}

/// Does the table match the default for this organisation and
/// precision? Matching tables may be transmitted as optional tags.
pub fn is_default_prescale(
    prescale: &[u32; MAX_WAVELETS],
    transform_type: TransformType,
    precision: usize,
) -> bool {
    *prescale == default_prescale(transform_type, precision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantization_law() {
        // dequant(quant(c, q)) stays within q of the coefficient
        for &divisor in &[1i32, 2, 3, 5, 8, 16, 100] {
            for &value in &[-32768i32, -12345, -8, -1, 0, 1, 7, 100, 32767] {
                let quantized = quantize(value, divisor, 0);
                let restored = dequantize(quantized, divisor);
                assert!(
                    (restored - value).abs() <= divisor,
                    "value {} divisor {}",
                    value,
                    divisor
                );
                if divisor > 1 {
                    assert!(restored > value - divisor && restored < value + divisor);
                }
            }
        }
    }

    #[test]
    fn test_quantization_is_midtread() {
        // Values below the divisor quantize to zero with no midpoint
        assert_eq!(quantize(7, 8, 0), 0);
        assert_eq!(quantize(-7, 8, 0), 0);
        assert_eq!(quantize(8, 8, 0), 1);
        assert_eq!(quantize(-8, 8, 0), -1);
    }

    #[test]
    fn test_midpoint_bias() {
        assert_eq!(quantization_midpoint(8, 0), 0);
        assert_eq!(quantization_midpoint(8, 2), 4);
        assert_eq!(quantization_midpoint(8, 8), 1);
        assert_eq!(quantization_midpoint(8, 9), 0);

        // The midpoint pulls the rounding threshold inward
        assert_eq!(quantize(4, 8, 4), 1);
        assert_eq!(quantize(-4, 8, 4), -1);
        assert_eq!(quantize(3, 8, 4), 0);
    }

    #[test]
    fn test_quantization_error_bounds_q8() {
        // Pseudo-random band over the full coefficient range
        let mut seed = 0x1357_9BDFu32;
        let mut next = || {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (seed >> 16) as i16 as i32
        };

        let mut max_error = 0i32;
        let mut total_error = 0i64;
        let count = 4096;

        for _ in 0..count {
            let value = next();
            let restored = dequantize(quantize(value, 8, 0), 8);
            let error = (restored - value).abs();
            max_error = max_error.max(error);
            total_error += error as i64;
        }

        assert!(max_error <= 7);
        assert!(total_error / count <= 4);
    }

    #[test]
    fn test_quantize_band_round_trip_is_bounded() {
        let width = 8;
        let height = 4;
        let pitch = 8;
        let mut band: Vec<i16> = (0..32).map(|i| (i * 37 - 600) as i16).collect();
        let original = band.clone();

        quantize_band(&mut band, width, height, pitch, 8, 0);
        dequantize_band(&mut band, width, height, pitch, 8);

        for (restored, original) in band.iter().zip(original.iter()) {
            assert!((restored - original).abs() <= 8);
        }
    }

    #[test]
    fn test_quality_table_shape() {
        // Lowpass is never quantized
        for quality in 0..QUALITY_LEVELS {
            assert_eq!(quantizer_for_subband(quality, 0), 1);
        }

        // Larger quality codes clamp to the finest bucket
        assert_eq!(quantizer_for_subband(0xFFFF, 1), 1);

        // Every divisor is at least one
        for quality in 0..QUALITY_LEVELS {
            for subband in 0..32 {
                assert!(quantizer_for_subband(quality, subband) >= 1);
            }
        }
    }

    #[test]
    fn test_prescale_pack_round_trip() {
        let mut prescale = [0u32; MAX_WAVELETS];
        prescale[0] = 2;
        prescale[1] = 2;
        prescale[2] = 3;
        prescale[5] = 1;

        let packed = pack_prescale(&prescale);
        assert_eq!(unpack_prescale(packed), prescale);
    }

    #[test]
    fn test_default_prescale_by_precision() {
        let spatial8 = default_prescale(TransformType::Spatial, 8);
        assert_eq!(spatial8, [0; MAX_WAVELETS]);

        let spatial10 = default_prescale(TransformType::Spatial, 10);
        assert_eq!(spatial10[0], 2);
        assert_eq!(spatial10[1], 0);

        let fieldplus10 = default_prescale(TransformType::FieldPlus, 10);
        assert_eq!(fieldplus10[0], 2);
        assert_eq!(fieldplus10[1], 2);

        assert!(is_default_prescale(&spatial8, TransformType::Spatial, 8));
        assert!(!is_default_prescale(&spatial8, TransformType::Spatial, 10));
    }
}
