#![allow(dead_code)]

//! Intraframe wavelet video codec core for a single-channel
//! spatio-temporal pyramid.
//!
//! The encoder decomposes each frame (or group of two frames) into a
//! pyramid of wavelet subbands, quantizes the highpass subbands, and
//! entropy-codes the quantized coefficients as run length and value
//! pairs drawn from a precomputed codebook. The decoder parses the
//! tag-delimited sample back into coefficients, dequantizes them, and
//! inverts the pyramid to reconstruct pixels.

use std::error;
use std::fmt;

use bitstream::{BitReader, BitstreamError};

pub mod codebook;
pub mod decoder;
pub mod encoder;
pub mod filter;
pub mod quant;
pub mod vlc;
pub mod wavelet;

pub use codebook::Codebooks;
pub use decoder::{DecodedChannel, DecodedGroup, Decoder};
pub use encoder::{ChannelInput, Encoder, EncoderParams};
pub use wavelet::{Transform, TransformType, WaveletImage, WaveletType};

/// Codec version written into every sequence header.
pub const CODEC_VERSION_MAJOR: u16 = 1;
pub const CODEC_VERSION_MINOR: u16 = 0;
pub const CODEC_VERSION_REVISION: u16 = 0;

/// Maximum number of wavelets in one transform pyramid.
pub const MAX_WAVELETS: usize = 8;

/// Maximum number of frames aggregated into one group.
pub const MAX_GOP_LENGTH: usize = 2;

/// Maximum number of color channels in one sample.
pub const MAX_CHANNELS: usize = 4;

/// The closed catalog of bitstream tags.
///
/// A tag is a positive 16-bit identifier that introduces a segment in
/// the bitstream. The negated form of any tag marks the segment as
/// optional. Tags with bit 0x2000 set declare chunk sizes and carry an
/// extra eight bits of the size field in the low byte of the tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Tag {
    Sample = 1,
    SampleEnd = 2,
    Index = 3,
    Entry = 4,
    Marker = 5,
    VersionMajor = 6,
    VersionMinor = 7,
    VersionRevision = 8,
    VersionEdit = 9,
    SequenceFlags = 10,
    TransformType = 11,
    NumFrames = 12,
    NumChannels = 13,
    NumWavelets = 14,
    NumSubbands = 15,
    NumSpatial = 16,
    FirstWavelet = 17,
    Channel = 18,

    FrameWidth = 20,
    FrameHeight = 21,
    FrameFormat = 22,
    InputFormat = 23,
    EncodedFormat = 24,
    EncodedColorspace = 25,
    FrameIndex = 26,
    FrameNumber = 27,
    FrameType = 28,
    Precision = 29,
    FrameDisplayHeight = 30,
    PresentationWidth = 31,
    PresentationHeight = 32,
    Version = 33,
    QualityLow = 34,
    QualityHigh = 35,
    PrescaleTable = 36,

    LowpassSubband = 40,
    NumLevels = 41,
    LowpassWidth = 42,
    LowpassHeight = 43,
    MarginLeft = 44,
    MarginTop = 45,
    MarginRight = 46,
    MarginBottom = 47,
    PixelOffset = 48,
    Quantization = 49,
    PixelDepth = 50,

    WaveletType = 51,
    WaveletNumber = 52,
    WaveletLevel = 53,
    NumBands = 54,
    HighpassWidth = 55,
    BandTrailer = 56,
    HighpassHeight = 57,
    LowpassBorder = 58,
    HighpassBorder = 59,
    LowpassScale = 60,
    LowpassDivisor = 61,

    BandNumber = 62,
    BandWidth = 63,
    BandHeight = 64,
    BandSubband = 65,
    BandEncoding = 66,
    BandQuantization = 67,
    BandScale = 68,
    BandHeader = 69,
    BandSecondPass = 70,
    BandCodingFlags = 71,

    GroupTrailer = 72,
    FrameTrailer = 73,
    InterlacedFlags = 74,
    ProtectionFlags = 75,
    PictureAspectX = 76,
    PictureAspectY = 77,
    SampleFlags = 78,
    PeakTableOffsetLow = 79,
    PeakTableOffsetHigh = 80,
    PeakLevel = 81,

    // Chunk-size tags (24-bit chunk flag set)
    SubbandSize = 0x2005,
    LevelSize = 0x2006,
    ChannelSize = 0x2007,
}

impl Tag {
    pub fn from_value(value: i16) -> Option<Tag> {
        let tag = match value {
            1 => Tag::Sample,
            2 => Tag::SampleEnd,
            3 => Tag::Index,
            4 => Tag::Entry,
            5 => Tag::Marker,
            6 => Tag::VersionMajor,
            7 => Tag::VersionMinor,
            8 => Tag::VersionRevision,
            9 => Tag::VersionEdit,
            10 => Tag::SequenceFlags,
            11 => Tag::TransformType,
            12 => Tag::NumFrames,
            13 => Tag::NumChannels,
            14 => Tag::NumWavelets,
            15 => Tag::NumSubbands,
            16 => Tag::NumSpatial,
            17 => Tag::FirstWavelet,
            18 => Tag::Channel,
            20 => Tag::FrameWidth,
            21 => Tag::FrameHeight,
            22 => Tag::FrameFormat,
            23 => Tag::InputFormat,
            24 => Tag::EncodedFormat,
            25 => Tag::EncodedColorspace,
            26 => Tag::FrameIndex,
            27 => Tag::FrameNumber,
            28 => Tag::FrameType,
            29 => Tag::Precision,
            30 => Tag::FrameDisplayHeight,
            31 => Tag::PresentationWidth,
            32 => Tag::PresentationHeight,
            33 => Tag::Version,
            34 => Tag::QualityLow,
            35 => Tag::QualityHigh,
            36 => Tag::PrescaleTable,
            40 => Tag::LowpassSubband,
            41 => Tag::NumLevels,
            42 => Tag::LowpassWidth,
            43 => Tag::LowpassHeight,
            44 => Tag::MarginLeft,
            45 => Tag::MarginTop,
            46 => Tag::MarginRight,
            47 => Tag::MarginBottom,
            48 => Tag::PixelOffset,
            49 => Tag::Quantization,
            50 => Tag::PixelDepth,
            51 => Tag::WaveletType,
            52 => Tag::WaveletNumber,
            53 => Tag::WaveletLevel,
            54 => Tag::NumBands,
            55 => Tag::HighpassWidth,
            56 => Tag::BandTrailer,
            57 => Tag::HighpassHeight,
            58 => Tag::LowpassBorder,
            59 => Tag::HighpassBorder,
            60 => Tag::LowpassScale,
            61 => Tag::LowpassDivisor,
            62 => Tag::BandNumber,
            63 => Tag::BandWidth,
            64 => Tag::BandHeight,
            65 => Tag::BandSubband,
            66 => Tag::BandEncoding,
            67 => Tag::BandQuantization,
            68 => Tag::BandScale,
            69 => Tag::BandHeader,
            70 => Tag::BandSecondPass,
            71 => Tag::BandCodingFlags,
            72 => Tag::GroupTrailer,
            73 => Tag::FrameTrailer,
            74 => Tag::InterlacedFlags,
            75 => Tag::ProtectionFlags,
            76 => Tag::PictureAspectX,
            77 => Tag::PictureAspectY,
            78 => Tag::SampleFlags,
            79 => Tag::PeakTableOffsetLow,
            80 => Tag::PeakTableOffsetHigh,
            81 => Tag::PeakLevel,
            0x2005 => Tag::SubbandSize,
            0x2006 => Tag::LevelSize,
            0x2007 => Tag::ChannelSize,
            _ => return None,
        };
        Some(tag)
    }

    /// The wire representation of the tag.
    pub fn value(self) -> i16 {
        self as i16
    }

    /// Chunk-size tags with the 24-bit size extension.
    pub fn is_chunk_size(self) -> bool {
        (self.value() & bitstream::TAG_CHUNK_24BIT_FLAG) != 0
    }
}

/// Types of media sample found in the bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    SequenceHeader,
    SequenceTrailer,
    Frame,
    IFrame,
    PFrame,
    Group,
    GroupTrailer,
    Channel,
}

impl SampleType {
    pub fn from_value(value: u16) -> Option<SampleType> {
        match value {
            1 => Some(SampleType::SequenceHeader),
            2 => Some(SampleType::SequenceTrailer),
            3 => Some(SampleType::Frame),
            4 => Some(SampleType::IFrame),
            5 => Some(SampleType::PFrame),
            6 => Some(SampleType::Group),
            7 => Some(SampleType::GroupTrailer),
            8 => Some(SampleType::Channel),
            _ => None,
        }
    }

    pub fn value(self) -> u16 {
        match self {
            SampleType::SequenceHeader => 1,
            SampleType::SequenceTrailer => 2,
            SampleType::Frame => 3,
            SampleType::IFrame => 4,
            SampleType::PFrame => 5,
            SampleType::Group => 6,
            SampleType::GroupTrailer => 7,
            SampleType::Channel => 8,
        }
    }
}

/// Methods for encoding the coefficients of one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandEncoding {
    /// Zerotree significance coding (legacy, not produced by this
    /// encoder).
    Zerotree,

    /// Run length and value codes from the current codeset.
    RunLengths,

    /// Uncompressed 16-bit coefficients.
    Lossless,
}

impl BandEncoding {
    pub fn from_value(value: u16) -> Option<BandEncoding> {
        match value {
            1 => Some(BandEncoding::Zerotree),
            2 => Some(BandEncoding::RunLengths),
            3 => Some(BandEncoding::Lossless),
            _ => None,
        }
    }

    pub fn value(self) -> u16 {
        match self {
            BandEncoding::Zerotree => 1,
            BandEncoding::RunLengths => 2,
            BandEncoding::Lossless => 3,
        }
    }
}

/// Pixel organisation of the encoded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedFormat {
    Yuv422,
    Rgb444,
    Rgba4444,
    Bayer,
}

impl EncodedFormat {
    pub fn from_value(value: u16) -> Option<EncodedFormat> {
        match value {
            1 => Some(EncodedFormat::Yuv422),
            2 => Some(EncodedFormat::Rgb444),
            3 => Some(EncodedFormat::Rgba4444),
            4 => Some(EncodedFormat::Bayer),
            _ => None,
        }
    }

    pub fn value(self) -> u16 {
        match self {
            EncodedFormat::Yuv422 => 1,
            EncodedFormat::Rgb444 => 2,
            EncodedFormat::Rgba4444 => 3,
            EncodedFormat::Bayer => 4,
        }
    }
}

// Color space flag bits stored in the encoded-colorspace tag
pub const COLOR_SPACE_BT_709: u16 = 0x0001;
pub const COLOR_SPACE_FULL_RANGE: u16 = 0x0002;

/// Errors reported by the encoder and decoder.
#[derive(Debug)]
pub enum CodecError {
    /// The output buffer was exhausted during encoding.
    BitstreamOverflow,

    /// The sample ended before parsing was complete.
    BitstreamUnderflow,

    /// An unknown required tag was read, or a required tag failed a
    /// range check.
    BadTag { tag: i16, value: u16 },

    /// An I/O mode mismatch.
    BadAccess,

    /// The decoder could not find any codebook entry matching the bit
    /// pattern at the current position.
    UnmatchedCode,

    /// A required delimiter was not present in the bitstream.
    MissingMarker { tag: i16 },

    /// A highpass header reported a wavelet number or level that does
    /// not match the decoder's position in the pyramid.
    HighpassIndex { expected: u16, actual: u16 },

    /// A header declared a dimension that is zero or out of range.
    InvalidDimension { width: usize, height: usize },

    /// The transform type read from the sample is not recognized.
    UnknownTransformType { value: u16 },

    /// The codebooks failed validation during initialization.
    BadCodebook { reason: String },
}

impl error::Error for CodecError {}
impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::BitstreamOverflow => {
                write!(f, "bitstream buffer overflow while encoding")
            }
            CodecError::BitstreamUnderflow => {
                write!(f, "bitstream buffer underflow while decoding")
            }
            CodecError::BadTag { tag, value } => {
                write!(f, "bad required tag {} with value {}", tag, value)
            }
            CodecError::BadAccess => write!(f, "bad bitstream access mode"),
            CodecError::UnmatchedCode => {
                write!(f, "no codebook entry matches the bit pattern")
            }
            CodecError::MissingMarker { tag } => {
                write!(f, "required delimiter tag {} is missing", tag)
            }
            CodecError::HighpassIndex { expected, actual } => {
                write!(
                    f,
                    "highpass header wavelet index {} does not match the expected index {}",
                    actual, expected
                )
            }
            CodecError::InvalidDimension { width, height } => {
                write!(f, "invalid dimensions {}x{}", width, height)
            }
            CodecError::UnknownTransformType { value } => {
                write!(f, "unknown transform type {}", value)
            }
            CodecError::BadCodebook { reason } => {
                write!(f, "codebook validation failed: {}", reason)
            }
        }
    }
}

impl From<BitstreamError> for CodecError {
    fn from(error: BitstreamError) -> Self {
        match error {
            BitstreamError::Overflow => CodecError::BitstreamOverflow,
            BitstreamError::Underflow => CodecError::BitstreamUnderflow,
            BitstreamError::BadTag => CodecError::BadTag { tag: 0, value: 0 },
            BitstreamError::BadAccess => CodecError::BadAccess,
        }
    }
}

/// Observe the sticky stream error at a checkpoint.
pub(crate) fn check_stream(stream: &BitReader) -> Result<(), CodecError> {
    match stream.error() {
        None => Ok(()),
        Some(error) => Err(error.into()),
    }
}

/// State accumulated by the decoder from the sample headers.
///
/// Metadata tags update this state as they are parsed; the transform
/// and wavelet storage are reconstructed from it when the coefficient
/// bands arrive.
#[derive(Debug, Clone)]
pub struct CodecState {
    pub frame_width: usize,
    pub frame_height: usize,
    pub display_height: usize,
    pub num_frames: usize,
    pub num_channels: usize,
    pub num_wavelets: usize,
    pub num_subbands: usize,
    pub num_spatial: usize,
    pub transform_type: TransformType,
    pub first_wavelet: u16,
    pub input_format: u16,
    pub encoded_format: Option<EncodedFormat>,
    pub color_space: u16,
    pub precision: usize,
    pub quality: u32,
    pub prescale_table: u16,
    pub interlaced_flags: u16,
    pub protection_flags: u16,
    pub picture_aspect_x: u16,
    pub picture_aspect_y: u16,
    pub frame_number: u16,
    pub version: (u16, u16, u16),
}

impl Default for CodecState {
    fn default() -> Self {
        CodecState {
            frame_width: 0,
            frame_height: 0,
            display_height: 0,
            num_frames: 1,
            num_channels: 1,
            num_wavelets: 0,
            num_subbands: 0,
            num_spatial: 0,
            transform_type: TransformType::Spatial,
            first_wavelet: WaveletType::Spatial.value(),
            input_format: 0,
            encoded_format: None,
            color_space: 0,
            precision: 8,
            quality: 0,
            prescale_table: 0,
            interlaced_flags: 0,
            protection_flags: 0,
            picture_aspect_x: 0,
            picture_aspect_y: 0,
            frame_number: 0,
            version: (CODEC_VERSION_MAJOR, CODEC_VERSION_MINOR, CODEC_VERSION_REVISION),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_values_round_trip() {
        for value in 1..=100i16 {
            if let Some(tag) = Tag::from_value(value) {
                assert_eq!(tag.value(), value);
            }
        }
        assert_eq!(Tag::from_value(Tag::BandTrailer.value()), Some(Tag::BandTrailer));
        assert_eq!(Tag::BandTrailer.value(), 56);
        assert!(Tag::from_value(0).is_none());
        assert!(Tag::from_value(999).is_none());
    }

    #[test]
    fn test_chunk_size_tags_carry_the_flag() {
        assert!(Tag::SubbandSize.is_chunk_size());
        assert!(Tag::LevelSize.is_chunk_size());
        assert!(Tag::ChannelSize.is_chunk_size());
        assert!(!Tag::BandTrailer.is_chunk_size());
        assert_eq!(Tag::from_value(0x2005), Some(Tag::SubbandSize));
    }

    #[test]
    fn test_sample_type_round_trip() {
        for value in 1..=8u16 {
            let sample_type = SampleType::from_value(value).unwrap();
            assert_eq!(sample_type.value(), value);
        }
        assert!(SampleType::from_value(0).is_none());
        assert!(SampleType::from_value(9).is_none());
    }

    #[test]
    fn test_error_display() {
        let error = CodecError::HighpassIndex { expected: 2, actual: 5 };
        assert!(format!("{}", error).contains("5"));
        let error = CodecError::BadTag { tag: 31, value: 7 };
        assert!(format!("{}", error).contains("31"));
    }
}
