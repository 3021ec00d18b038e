//! Sample assembler, encode side.
//!
//! One sample is one group of frames. The encoder computes the wavelet
//! pyramid for every channel, quantizes the highpass bands, and walks
//! the pyramid in canonical order: for each wavelet the apex lowpass
//! block first, then each highpass band wrapped in its tag header and
//! chunk-size segments, with the coefficients packed by the variable
//! length coder. Channel sizes are back-patched into the group index
//! block after all channels have been written.

use bitstream::BitWriter;
use log::{debug, info};
use std::convert::TryInto;

use crate::codebook::Codebooks;
use crate::filter;
use crate::quant;
use crate::vlc;
use crate::wavelet::{
    self, FilterKind, HeapScratch, ScratchProvider, Transform, TransformSource, TransformType,
    WaveletImage, LL_BAND,
};
use crate::{
    BandEncoding, CodecError, EncodedFormat, SampleType, Tag, CODEC_VERSION_MAJOR,
    CODEC_VERSION_MINOR, CODEC_VERSION_REVISION, MAX_CHANNELS, MAX_GOP_LENGTH, MAX_WAVELETS,
};

/// Encoding options recognized at encode time.
#[derive(Debug, Clone)]
pub struct EncoderParams {
    pub transform_type: TransformType,

    /// Number of frames per sample (1 or 2).
    pub gop_length: usize,

    /// Number of spatial wavelet levels per channel.
    pub num_spatial: usize,

    /// Bits per component of the input (8, 10, 12, or 16); selects the
    /// default prescale table.
    pub precision: usize,

    /// Informational input format code; the tag becomes required at
    /// values of 100 and above.
    pub input_format: u16,

    /// Pixel organisation of the encoded sample; required in the
    /// bitstream when not the default.
    pub encoded_format: Option<EncodedFormat>,

    /// Color space flag bits, stored as an optional tag when nonzero.
    pub color_space: u16,

    /// 32-bit quality code selecting the per-band quantizers.
    pub quality: u32,

    /// Explicit prescale table; the per-precision default when absent.
    pub prescale_table: Option<[u32; MAX_WAVELETS]>,

    /// Midtread midpoint denominator: zero for strict floor, or a
    /// denominator between two and eight.
    pub midpoint_prequant: u16,

    pub frame_number: u16,
}

impl Default for EncoderParams {
    fn default() -> Self {
        EncoderParams {
            transform_type: TransformType::FieldPlus,
            gop_length: 2,
            num_spatial: 3,
            precision: 8,
            input_format: 0,
            encoded_format: None,
            color_space: 0,
            quality: 3,
            prescale_table: None,
            midpoint_prequant: 0,
            frame_number: 0,
        }
    }
}

/// The frames of one color channel supplied to the encoder.
///
/// Each frame is a packed raster of 16-bit components with a row
/// stride equal to the width.
pub struct ChannelInput<'a> {
    pub width: usize,
    pub height: usize,
    pub frames: Vec<&'a [i16]>,
}

/// Encoder for samples of one video sequence.
pub struct Encoder<'a> {
    codebooks: &'a Codebooks,
    params: EncoderParams,
    prescale: [u32; MAX_WAVELETS],

    // Scratch buffers for the forward kernels, recycled across frames
    scratch: HeapScratch,
}

impl<'a> Encoder<'a> {
    pub fn new(codebooks: &'a Codebooks, params: EncoderParams) -> Result<Encoder<'a>, CodecError> {
        if params.gop_length == 0 || params.gop_length > MAX_GOP_LENGTH {
            return Err(CodecError::InvalidDimension {
                width: params.gop_length,
                height: 0,
            });
        }

        // The transform organisation dictates the group length
        let frames_needed = match params.transform_type {
            TransformType::Spatial | TransformType::Interlaced => 1,
            TransformType::Field | TransformType::FieldPlus | TransformType::Frame => 2,
        };
        if params.gop_length != frames_needed {
            return Err(CodecError::InvalidDimension {
                width: params.gop_length,
                height: frames_needed,
            });
        }

        let prescale = params
            .prescale_table
            .unwrap_or_else(|| quant::default_prescale(params.transform_type, params.precision));

        Ok(Encoder {
            codebooks,
            params,
            prescale,
            scratch: HeapScratch::new(),
        })
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    /// Write the sequence header sample, once per stream.
    pub fn encode_sequence_header(
        &self,
        stream: &mut BitWriter,
        width: usize,
        height: usize,
    ) -> Result<(), CodecError> {
        stream.put_tag_pair(Tag::Sample.value(), SampleType::SequenceHeader.value());

        stream.put_tag_pair(Tag::VersionMajor.value(), CODEC_VERSION_MAJOR);
        stream.put_tag_pair(Tag::VersionMinor.value(), CODEC_VERSION_MINOR);
        stream.put_tag_pair(Tag::VersionRevision.value(), CODEC_VERSION_REVISION);
        stream.put_tag_pair(Tag::VersionEdit.value(), 0);
        stream.put_tag_pair(Tag::SequenceFlags.value(), 0);

        stream.put_tag_pair(Tag::FrameWidth.value(), width as u16);
        stream.put_tag_pair(Tag::FrameHeight.value(), height as u16);
        stream.put_tag_pair(
            Tag::FrameFormat.value(),
            self.params.encoded_format.map(EncodedFormat::value).unwrap_or(0),
        );

        // The input format is informational below 100
        if self.params.input_format >= 100 {
            stream.put_tag_pair(Tag::InputFormat.value(), self.params.input_format);
        } else {
            stream.put_tag_pair_optional(Tag::InputFormat.value(), self.params.input_format);
        }

        if let Some(format) = self.params.encoded_format {
            stream.put_tag_pair(Tag::EncodedFormat.value(), format.value());
        }

        stream.put_tag_pair(Tag::SampleEnd.value(), 0);
        stream.status().map_err(CodecError::from)
    }

    /// Write the sequence trailer sample.
    pub fn encode_sequence_trailer(&self, stream: &mut BitWriter) -> Result<(), CodecError> {
        stream.put_tag_pair(Tag::Sample.value(), SampleType::SequenceTrailer.value());
        stream.put_tag_pair(Tag::SampleEnd.value(), 0);
        stream.status().map_err(CodecError::from)
    }

    /// Encode one group of frames into a sample.
    ///
    /// Every channel carries `gop_length` frames of identical shape;
    /// channels may differ in shape from each other.
    pub fn encode_group(
        &mut self,
        stream: &mut BitWriter,
        channels: &[ChannelInput],
    ) -> Result<(), CodecError> {
        if channels.is_empty() || channels.len() > MAX_CHANNELS {
            return Err(CodecError::InvalidDimension {
                width: channels.len(),
                height: 0,
            });
        }
        for channel in channels {
            if channel.frames.len() != self.params.gop_length {
                return Err(CodecError::InvalidDimension {
                    width: channel.frames.len(),
                    height: self.params.gop_length,
                });
            }
            // Every channel of the group shares the frame dimensions
            if channel.width != channels[0].width || channel.height != channels[0].height {
                return Err(CodecError::InvalidDimension {
                    width: channel.width,
                    height: channel.height,
                });
            }
            for frame in &channel.frames {
                if frame.len() != channel.width * channel.height {
                    return Err(CodecError::InvalidDimension {
                        width: channel.width,
                        height: channel.height,
                    });
                }
            }
        }

        // Compute the wavelet pyramid for every channel
        let mut transforms = Vec::with_capacity(channels.len());
        for channel in channels {
            transforms.push(self.forward_transform(channel)?);
        }

        info!(
            "encoding group of {} frames, {} channels, {} subbands",
            self.params.gop_length,
            channels.len(),
            transforms[0].subband_count()
        );

        let is_group = self.params.gop_length > 1;
        let index_offset = self.put_group_header(stream, &transforms[0], channels.len(), is_group);

        // Per-channel blocks, remembering the size of each
        let mut channel_sizes = Vec::with_capacity(channels.len());
        for (channel, transform) in transforms.iter().enumerate() {
            let start = stream.position();
            self.put_channel(stream, transform, channel)?;
            channel_sizes.push((stream.position() - start) as u32);
        }

        // Group or frame trailer with a placeholder checksum
        if is_group {
            stream.put_tag_pair(Tag::Sample.value(), SampleType::GroupTrailer.value());
            stream.put_tag_pair(Tag::GroupTrailer.value(), 0);
        } else {
            stream.put_tag_pair(Tag::FrameTrailer.value(), 0);
        }
        stream.put_tag_pair(Tag::SampleEnd.value(), 0);

        // Back-patch the channel sizes into the index block
        if let Some(offset) = index_offset {
            for (channel, size) in channel_sizes.iter().enumerate() {
                stream.patch_long(offset + channel * 4, *size);
            }
        }

        stream.status().map_err(CodecError::from)
    }

    // Write the group or intra-frame header; returns the offset of the
    // channel-size index entries when an index block was written.
    fn put_group_header(
        &self,
        stream: &mut BitWriter,
        transform: &Transform,
        num_channels: usize,
        is_group: bool,
    ) -> Option<usize> {
        let sample_type = if is_group {
            SampleType::Group
        } else {
            SampleType::IFrame
        };
        stream.put_tag_pair(Tag::Sample.value(), sample_type.value());

        // The index block holds one longword per channel, patched with
        // the channel sizes after all channels are written
        let index_offset = if is_group {
            stream.put_tag_pair(Tag::Index.value(), num_channels as u16);
            let offset = stream.position();
            for _ in 0..num_channels {
                stream.put_long(0);
            }
            Some(offset)
        } else {
            None
        };

        stream.put_tag_pair(Tag::TransformType.value(), transform.transform_type.value());
        stream.put_tag_pair(Tag::NumFrames.value(), transform.num_frames as u16);
        stream.put_tag_pair(Tag::NumChannels.value(), num_channels as u16);

        if self.params.input_format >= 100 {
            stream.put_tag_pair(Tag::InputFormat.value(), self.params.input_format);
        } else {
            stream.put_tag_pair_optional(Tag::InputFormat.value(), self.params.input_format);
        }
        if let Some(format) = self.params.encoded_format {
            stream.put_tag_pair(Tag::EncodedFormat.value(), format.value());
        }
        if self.params.color_space != 0 {
            stream.put_tag_pair_optional(Tag::EncodedColorspace.value(), self.params.color_space);
        }

        stream.put_tag_pair(Tag::NumWavelets.value(), transform.num_wavelets as u16);
        stream.put_tag_pair(Tag::NumSubbands.value(), transform.subband_count() as u16);
        stream.put_tag_pair(Tag::NumSpatial.value(), transform.num_spatial as u16);
        stream.put_tag_pair(
            Tag::FirstWavelet.value(),
            transform.first_wavelet_type().value(),
        );

        stream.put_tag_pair(Tag::FrameWidth.value(), transform.width as u16);
        stream.put_tag_pair(Tag::FrameHeight.value(), transform.height as u16);
        stream.put_tag_pair_optional(Tag::FrameNumber.value(), self.params.frame_number);
        stream.put_tag_pair(Tag::Precision.value(), self.params.precision as u16);

        // Packed version code for decoders that track encoder builds
        let version = (CODEC_VERSION_MAJOR << 12)
            | (CODEC_VERSION_MINOR << 8)
            | CODEC_VERSION_REVISION;
        stream.put_tag_pair_optional(Tag::Version.value(), version);

        stream.put_tag_pair_optional(Tag::QualityLow.value(), (self.params.quality & 0xFFFF) as u16);
        stream.put_tag_pair_optional(
            Tag::QualityHigh.value(),
            ((self.params.quality >> 16) & 0xFFFF) as u16,
        );

        // The prescale table may be omitted by older decoders only
        // when it matches the default for this precision
        let packed_prescale = quant::pack_prescale(&self.prescale);
        if quant::is_default_prescale(
            &self.prescale,
            self.params.transform_type,
            self.params.precision,
        ) {
            stream.put_tag_pair_optional(Tag::PrescaleTable.value(), packed_prescale);
        } else {
            stream.put_tag_pair(Tag::PrescaleTable.value(), packed_prescale);
        }

        self.put_group_extension(stream);

        index_offset
    }

    // Optional tags describing the source material
    fn put_group_extension(&self, stream: &mut BitWriter) {
        let interlaced = matches!(
            self.params.transform_type,
            TransformType::Interlaced | TransformType::Field | TransformType::FieldPlus
        );
        if interlaced {
            stream.put_tag_pair_optional(Tag::InterlacedFlags.value(), 1);
        }
        stream.put_tag_pair_optional(Tag::ProtectionFlags.value(), 0);
        stream.put_tag_pair_optional(Tag::PictureAspectX.value(), 16);
        stream.put_tag_pair_optional(Tag::PictureAspectY.value(), 9);
    }

    fn put_channel(
        &self,
        stream: &mut BitWriter,
        transform: &Transform,
        channel: usize,
    ) -> Result<(), CodecError> {
        stream.put_tag_pair(Tag::Sample.value(), SampleType::Channel.value());
        stream.put_tag_pair(Tag::Channel.value(), channel as u16);

        let apex = transform.apex_wavelet();
        let map = transform.subband_map();

        for index in 0..transform.num_wavelets {
            let wavelet = &transform.wavelets[index];

            // The apex lowpass block precedes the highpass bands
            if index == apex {
                self.put_lowpass_band(stream, wavelet);
            }

            let bands: Vec<(usize, usize)> = map
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(_, location)| location.wavelet == index)
                .map(|(subband, location)| (subband, location.band))
                .collect();

            if bands.is_empty() {
                continue;
            }

            self.put_highpass_header(stream, wavelet, index, bands.len());

            for (subband, band) in bands {
                self.put_band(stream, wavelet, band, subband);
            }

            // Close the wavelet level chunk
            stream.size_tag_pop();
        }

        stream.status().map_err(CodecError::from)
    }

    // The apex lowpass band is transmitted as raw 16-bit coefficients
    fn put_lowpass_band(&self, stream: &mut BitWriter, wavelet: &WaveletImage) {
        debug!(
            "lowpass band {}x{} at byte offset {}",
            wavelet.width,
            wavelet.height,
            stream.byte_count()
        );

        stream.put_tag_pair(Tag::LowpassSubband.value(), 0);
        stream.put_tag_pair(Tag::NumLevels.value(), wavelet.level as u16);
        stream.put_tag_pair(Tag::LowpassWidth.value(), wavelet.width as u16);
        stream.put_tag_pair(Tag::LowpassHeight.value(), wavelet.height as u16);

        // The transmitted dimensions may be less than the full image
        stream.put_tag_pair(Tag::MarginLeft.value(), 0);
        stream.put_tag_pair(Tag::MarginTop.value(), 0);
        stream.put_tag_pair(Tag::MarginRight.value(), 0);
        stream.put_tag_pair(Tag::MarginBottom.value(), 0);

        stream.put_tag_pair(Tag::PixelOffset.value(), 0);
        stream.put_tag_pair(Tag::Quantization.value(), wavelet.quant[LL_BAND]);
        stream.put_tag_pair(Tag::PixelDepth.value(), 16);

        stream.size_tag_push(Tag::SubbandSize.value());

        let data = wavelet.band(LL_BAND);
        let pitch = wavelet.pitch_units();
        for row in 0..wavelet.height {
            for &value in &data[row * pitch..row * pitch + wavelet.width] {
                stream.put_word_16s(value as i32);
            }
        }

        // Pad the pixel data out to a tag boundary
        stream.flush_align(4);
        stream.size_tag_pop();
    }

    fn put_highpass_header(
        &self,
        stream: &mut BitWriter,
        wavelet: &WaveletImage,
        index: usize,
        band_count: usize,
    ) {
        stream.put_tag_pair(Tag::WaveletType.value(), wavelet.wavelet_type.value());
        stream.put_tag_pair(Tag::WaveletNumber.value(), index as u16);
        stream.put_tag_pair(Tag::WaveletLevel.value(), wavelet.level as u16);
        stream.put_tag_pair(Tag::NumBands.value(), band_count as u16);

        stream.put_tag_pair(Tag::HighpassWidth.value(), wavelet.width as u16);
        stream.put_tag_pair(Tag::HighpassHeight.value(), wavelet.height as u16);

        stream.put_tag_pair(Tag::LowpassBorder.value(), 0);
        stream.put_tag_pair(Tag::HighpassBorder.value(), 0);

        stream.put_tag_pair(Tag::LowpassScale.value(), wavelet.scale[LL_BAND] as u16);
        stream.put_tag_pair(Tag::LowpassDivisor.value(), wavelet.quant[LL_BAND]);

        stream.size_tag_push(Tag::LevelSize.value());
    }

    fn put_band(
        &self,
        stream: &mut BitWriter,
        wavelet: &WaveletImage,
        band: usize,
        subband: usize,
    ) {
        debug!(
            "band {} subband {} quant {} at byte offset {}",
            band,
            subband,
            wavelet.quant[band],
            stream.byte_count()
        );

        stream.put_tag_pair(Tag::BandNumber.value(), band as u16);
        stream.put_tag_pair(Tag::BandWidth.value(), wavelet.width as u16);
        stream.put_tag_pair(Tag::BandHeight.value(), wavelet.height as u16);
        stream.put_tag_pair(Tag::BandSubband.value(), subband as u16);
        stream.put_tag_pair(Tag::BandEncoding.value(), BandEncoding::RunLengths.value());
        stream.put_tag_pair(Tag::BandQuantization.value(), wavelet.quant[band]);
        stream.put_tag_pair(Tag::BandScale.value(), wavelet.scale[band] as u16);

        stream.size_tag_push(Tag::SubbandSize.value());
        stream.put_tag_pair(Tag::BandHeader.value(), 0);

        vlc::encode_band(
            stream,
            self.codebooks,
            wavelet.band(band),
            wavelet.width,
            wavelet.height,
            wavelet.pitch_units(),
        );

        // Pad to the next tag boundary and close the band
        stream.pad_bits_tag();
        stream.put_tag_pair(Tag::BandTrailer.value(), 0);
        stream.size_tag_pop();
    }

    // Compute the forward transform of one channel
    fn forward_transform(&mut self, channel: &ChannelInput) -> Result<Transform, CodecError> {
        let mut transform = Transform::allocate(
            self.params.transform_type,
            channel.width,
            channel.height,
            self.params.gop_length,
            self.params.num_spatial,
        )?;
        transform.prescale = self.prescale;

        for index in 0..transform.num_wavelets {
            forward_wavelet(&mut transform, index, &channel.frames, &mut self.scratch)?;
        }

        set_transform_scale(&mut transform);
        self.quantize_transform(&mut transform);

        if log::log_enabled!(log::Level::Debug) {
            let apex = transform.apex_wavelet();
            let stats = wavelet::compute_band_statistics(&transform.wavelets[apex], LL_BAND);
            debug!("apex lowpass statistics: {:?}", stats);
        }

        Ok(transform)
    }

    // Quantize every encoded highpass band in place, recording the
    // divisor that was applied. Lowpass bands are never quantized.
    fn quantize_transform(&self, transform: &mut Transform) {
        let map = transform.subband_map();

        for (subband, location) in map.iter().enumerate() {
            let divisor = if subband == 0 || location.band == LL_BAND {
                1
            } else {
                quant::quantizer_for_subband(self.params.quality, subband)
            };

            let wavelet = &mut transform.wavelets[location.wavelet];
            wavelet.quant[location.band] = divisor;

            if divisor > 1 {
                let width = wavelet.width;
                let height = wavelet.height;
                let pitch = wavelet.pitch_units();
                quant::quantize_band(
                    wavelet.band_mut(location.band),
                    width,
                    height,
                    pitch,
                    divisor,
                    self.params.midpoint_prequant,
                );
            }
        }
    }
}

// Copy a source band or input frame into a packed scratch buffer,
// applying the prescale shift.
fn copy_source(
    transform: &Transform,
    frames: &[&[i16]],
    source: TransformSource,
    shift: u32,
    scratch: &mut dyn ScratchProvider,
) -> (Vec<i16>, usize, usize) {
    match source.wavelet {
        None => {
            let frame = frames[source.band];
            let width = transform.width;
            let height = transform.height;
            let mut data = scratch.acquire(width * height);
            for (output, &value) in data.iter_mut().zip(frame.iter()) {
                *output = value >> shift;
            }
            (data, width, height)
        }
        Some(index) => {
            let wavelet = &transform.wavelets[index];
            let band = wavelet.band(source.band);
            let pitch = wavelet.pitch_units();
            let mut data = scratch.acquire(wavelet.width * wavelet.height);
            for row in 0..wavelet.height {
                let line = &band[row * pitch..row * pitch + wavelet.width];
                for (column, &value) in line.iter().enumerate() {
                    data[row * wavelet.width + column] = value >> shift;
                }
            }
            (data, wavelet.width, wavelet.height)
        }
    }
}

// Apply the forward filter that produces one wavelet of the pyramid.
fn forward_wavelet(
    transform: &mut Transform,
    index: usize,
    frames: &[&[i16]],
    scratch: &mut dyn ScratchProvider,
) -> Result<(), CodecError> {
    let descriptor = transform.descriptors[index];
    let shift = transform.prescale[index];

    let (source1, width, height) =
        copy_source(transform, frames, descriptor.source1, shift, scratch);

    match descriptor.filter {
        FilterKind::Spatial => {
            let wavelet = &mut transform.wavelets[index];
            debug_assert!(wavelet.width == width / 2 && wavelet.height == height / 2);
            let pitch = wavelet.pitch_units();
            let bands: [&mut [i16]; 4] = wavelet
                .shared_bands_mut()
                .try_into()
                .map_err(|_| CodecError::BadAccess)?;
            filter::forward_spatial(&source1, width, width, height, bands, pitch);
        }
        FilterKind::Interlaced => {
            let wavelet = &mut transform.wavelets[index];
            debug_assert!(wavelet.width == width / 2 && wavelet.height == height / 2);
            let pitch = wavelet.pitch_units();
            let bands: [&mut [i16]; 4] = wavelet
                .shared_bands_mut()
                .try_into()
                .map_err(|_| CodecError::BadAccess)?;
            filter::forward_frame(&source1, width, width, height, bands, pitch);
        }
        FilterKind::Temporal => {
            let second = descriptor.source2.ok_or(CodecError::BadAccess)?;
            let (source2, width2, height2) =
                copy_source(transform, frames, second, shift, scratch);
            debug_assert!(width == width2 && height == height2);
            let _ = (width2, height2);

            let wavelet = &mut transform.wavelets[index];
            let pitch = wavelet.pitch_units();
            let bands: [&mut [i16]; 2] = wavelet
                .shared_bands_mut()
                .try_into()
                .map_err(|_| CodecError::BadAccess)?;
            let [lowpass, highpass] = bands;
            filter::forward_temporal(
                &source1, width, &source2, width, width, height, lowpass, pitch, highpass, pitch,
            );

            scratch.release(source2);
        }
        FilterKind::Unspecified => return Err(CodecError::BadAccess),
    }

    scratch.release(source1);
    Ok(())
}

// Record the cumulative amplitude expansion of every band, used to
// rescale the final lowpass band for display.
fn set_transform_scale(transform: &mut Transform) {
    for index in 0..transform.num_wavelets {
        let descriptor = transform.descriptors[index];
        let shift = transform.prescale[index];

        let input_scale = match descriptor.source1.wavelet {
            None => 1u32,
            Some(source) => transform.wavelets[source].scale[descriptor.source1.band],
        };
        let input_scale = (input_scale >> shift).max(1);

        let wavelet = &mut transform.wavelets[index];
        match descriptor.filter {
            FilterKind::Spatial | FilterKind::Interlaced => {
                wavelet.scale[0] = input_scale * 4;
                wavelet.scale[1] = input_scale * 2;
                wavelet.scale[2] = input_scale * 2;
                wavelet.scale[3] = input_scale;
            }
            FilterKind::Temporal => {
                wavelet.scale[0] = input_scale * 2;
                wavelet.scale[1] = input_scale;
            }
            FilterKind::Unspecified => {}
        }
    }
}
