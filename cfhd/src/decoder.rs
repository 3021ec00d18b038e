//! Sample assembler, decode side.
//!
//! The decoder reads tag value segments from the sample, skipping
//! optional tags it does not recognize and rejecting unknown required
//! tags. Metadata tags update the codec state; band headers locate the
//! target wavelet and band in the reconstructed transform, and the
//! coefficients are scanned with the run length decoder until the band
//! end codeword. Once the group trailer arrives the pyramid is
//! dequantized and inverted from the apex down to the output frames.
//!
//! On error the decoder stops emitting further pixels; rows written
//! before the error remain valid output.

use bitstream::BitReader;
use log::{debug, info, warn};

use crate::codebook::Codebooks;
use crate::filter;
use crate::quant;
use crate::vlc;
use crate::wavelet::{
    FilterKind, HeapScratch, ScratchProvider, Transform, TransformSource, TransformType, LL_BAND,
};
use crate::{check_stream, BandEncoding, CodecError, CodecState, SampleType, Tag, MAX_CHANNELS};

/// The reconstructed frames of one channel.
#[derive(Debug)]
pub struct DecodedChannel {
    pub width: usize,
    pub height: usize,
    pub frames: Vec<Vec<i16>>,
}

/// The result of decoding one group sample.
#[derive(Debug)]
pub struct DecodedGroup {
    pub width: usize,
    pub height: usize,
    pub num_frames: usize,
    pub channels: Vec<DecodedChannel>,
}

// Per-channel decode state while a group sample is being parsed
struct ChannelDecode {
    transform: Transform,

    // Expected position in the pyramid for the highpass consistency check
    next_wavelet: usize,

    lowpass_seen: bool,
}

/// Decoder for samples of one video sequence.
pub struct Decoder<'a> {
    codebooks: &'a Codebooks,
    state: CodecState,

    // Explicit prescale table from the sample, if one was transmitted
    prescale_override: Option<u16>,

    // Scratch buffers for the inverse kernels, recycled across samples
    scratch: HeapScratch,
}

impl<'a> Decoder<'a> {
    pub fn new(codebooks: &'a Codebooks) -> Decoder<'a> {
        Decoder {
            codebooks,
            state: CodecState::default(),
            prescale_override: None,
            scratch: HeapScratch::new(),
        }
    }

    pub fn state(&self) -> &CodecState {
        &self.state
    }

    /// Skip to the end of the encoded subband.
    ///
    /// Scans the stream for the band trailer so that decoding can
    /// resynchronize at the next band after a band-level error.
    // TODO: Seek by the patched subband-size segment instead of
    // scanning for the trailer once damaged-band recovery needs it.
    pub fn skip_subband(stream: &mut BitReader) -> Result<(), CodecError> {
        stream.align_bits_tag();

        loop {
            let segment = stream.get_tag_value();
            check_stream(stream)?;
            if segment.tag == Tag::BandTrailer.value() {
                return Ok(());
            }
        }
    }

    /// Parse the bitstream to find the next media sample.
    pub fn find_next_sample(stream: &mut BitReader) -> Result<SampleType, CodecError> {
        let segment = stream.get_tag_value();
        check_stream(stream)?;

        if segment.tag != Tag::Sample.value() {
            return Err(CodecError::MissingMarker {
                tag: Tag::Sample.value(),
            });
        }

        SampleType::from_value(segment.value).ok_or(CodecError::BadTag {
            tag: segment.tag,
            value: segment.value,
        })
    }

    /// Decode segments until one group (or intra frame) sample has
    /// been reconstructed.
    ///
    /// Returns `None` when the stream ends cleanly or a sequence
    /// trailer is found before any group data.
    pub fn decode_sample(
        &mut self,
        stream: &mut BitReader,
    ) -> Result<Option<DecodedGroup>, CodecError> {
        let mut channels: Vec<ChannelDecode> = Vec::new();
        let mut current_channel: Option<usize> = None;
        let mut group_open = false;

        loop {
            // Optional segments may appear in any order; recognized
            // tags update the codec state, others are skipped.
            if let Some(optional) = stream.get_tag_optional() {
                if let Some(tag) = Tag::from_value(optional.tag) {
                    self.update_codec_state(tag, optional.value)?;
                } else {
                    debug!(
                        "skipping unrecognized optional tag {} at byte offset {}",
                        optional.tag,
                        stream.byte_position()
                    );
                }
                continue;
            }

            if stream.error().is_some() {
                // A clean end of the stream outside a sample
                if !group_open {
                    return Ok(None);
                }
                return check_stream(stream).map(|_| None);
            }

            let segment = stream.get_segment();
            if stream.error().is_some() {
                if !group_open {
                    return Ok(None);
                }
                return check_stream(stream).map(|_| None);
            }

            let tag = Tag::from_value(segment.tag).ok_or(CodecError::BadTag {
                tag: segment.tag,
                value: segment.value,
            })?;

            match tag {
                Tag::Sample => match SampleType::from_value(segment.value) {
                    Some(SampleType::SequenceHeader) => {
                        info!("sequence header at byte offset {}", stream.byte_position());
                    }
                    Some(SampleType::SequenceTrailer) => {
                        return Ok(None);
                    }
                    Some(SampleType::Group)
                    | Some(SampleType::IFrame)
                    | Some(SampleType::Frame)
                    | Some(SampleType::PFrame) => {
                        info!("group sample at byte offset {}", stream.byte_position());
                        group_open = true;
                    }
                    Some(SampleType::Channel) => {
                        // The channel number follows in its own segment
                    }
                    Some(SampleType::GroupTrailer) => {
                        // The group trailer tag follows
                    }
                    None => {
                        return Err(CodecError::BadTag {
                            tag: segment.tag,
                            value: segment.value,
                        });
                    }
                },

                // Informational delimiters never block parsing
                Tag::SampleEnd | Tag::Marker | Tag::Entry => {}

                Tag::Index => {
                    // Channel sizes; the decoder reads sequentially
                    for _ in 0..segment.value {
                        stream.skip_long();
                    }
                }

                Tag::Channel => {
                    let channel = segment.value as usize;
                    if channel >= MAX_CHANNELS || channel > channels.len() {
                        return Err(CodecError::BadTag {
                            tag: segment.tag,
                            value: segment.value,
                        });
                    }
                    if channel == channels.len() {
                        channels.push(self.open_channel()?);
                    }
                    debug!("channel {} at byte offset {}", channel, stream.byte_position());
                    current_channel = Some(channel);
                }

                Tag::LowpassSubband => {
                    let channel = current_channel.ok_or(CodecError::MissingMarker {
                        tag: Tag::Channel.value(),
                    })?;
                    self.decode_lowpass(stream, &mut channels[channel], segment.value)?;
                }

                Tag::WaveletType => {
                    let channel = current_channel.ok_or(CodecError::MissingMarker {
                        tag: Tag::Channel.value(),
                    })?;
                    self.decode_highpass_header(stream, &mut channels[channel], segment.value)?;
                }

                Tag::BandNumber => {
                    let channel = current_channel.ok_or(CodecError::MissingMarker {
                        tag: Tag::Channel.value(),
                    })?;
                    self.decode_band(stream, &mut channels[channel], segment.value)?;
                }

                Tag::GroupTrailer | Tag::FrameTrailer => {
                    if !group_open {
                        return Err(CodecError::MissingMarker {
                            tag: Tag::Sample.value(),
                        });
                    }
                    info!(
                        "group trailer at byte offset {}, checksum {}",
                        stream.byte_position(),
                        segment.value
                    );
                    return self.finish_group(channels).map(Some);
                }

                // Everything else is sample metadata
                _ => self.update_codec_state(tag, segment.value)?,
            }
        }
    }

    // Update the decoder state from one metadata tag.
    fn update_codec_state(&mut self, tag: Tag, value: u16) -> Result<(), CodecError> {
        let bad_tag = |tag: Tag, value: u16| CodecError::BadTag {
            tag: tag.value(),
            value,
        };

        match tag {
            Tag::TransformType => {
                self.state.transform_type =
                    TransformType::from_value(value).ok_or(CodecError::UnknownTransformType { value })?;
            }
            Tag::NumFrames => {
                if !(1..=2).contains(&(value as usize)) {
                    return Err(bad_tag(tag, value));
                }
                self.state.num_frames = value as usize;
            }
            Tag::NumChannels => {
                if !(1..=MAX_CHANNELS).contains(&(value as usize)) {
                    return Err(bad_tag(tag, value));
                }
                self.state.num_channels = value as usize;
            }
            Tag::NumWavelets => self.state.num_wavelets = value as usize,
            Tag::NumSubbands => self.state.num_subbands = value as usize,
            Tag::NumSpatial => {
                if value == 0 || value as usize > crate::MAX_WAVELETS {
                    return Err(bad_tag(tag, value));
                }
                self.state.num_spatial = value as usize;
            }
            Tag::FirstWavelet => self.state.first_wavelet = value,
            Tag::FrameWidth => self.state.frame_width = value as usize,
            Tag::FrameHeight => self.state.frame_height = value as usize,
            Tag::FrameDisplayHeight => self.state.display_height = value as usize,
            Tag::Precision => {
                if value == 0 || value > 16 {
                    return Err(bad_tag(tag, value));
                }
                self.state.precision = value as usize;
            }
            Tag::InputFormat => self.state.input_format = value,
            Tag::EncodedFormat => {
                self.state.encoded_format = Some(
                    crate::EncodedFormat::from_value(value).ok_or_else(|| bad_tag(tag, value))?,
                );
            }
            Tag::EncodedColorspace => self.state.color_space = value,
            Tag::QualityLow => {
                self.state.quality = (self.state.quality & 0xFFFF_0000) | value as u32;
            }
            Tag::QualityHigh => {
                self.state.quality = (self.state.quality & 0xFFFF) | ((value as u32) << 16);
            }
            Tag::PrescaleTable => {
                self.state.prescale_table = value;
                self.prescale_override = Some(value);
            }
            Tag::InterlacedFlags => self.state.interlaced_flags = value,
            Tag::ProtectionFlags => self.state.protection_flags = value,
            Tag::PictureAspectX => self.state.picture_aspect_x = value,
            Tag::PictureAspectY => self.state.picture_aspect_y = value,
            Tag::FrameNumber => self.state.frame_number = value,
            Tag::VersionMajor => self.state.version.0 = value,
            Tag::VersionMinor => self.state.version.1 = value,
            Tag::VersionRevision => self.state.version.2 = value,

            // Recognized but not tracked
            Tag::VersionEdit
            | Tag::SequenceFlags
            | Tag::SampleFlags
            | Tag::FrameFormat
            | Tag::FrameIndex
            | Tag::FrameType
            | Tag::PresentationWidth
            | Tag::PresentationHeight
            | Tag::Version
            | Tag::SubbandSize
            | Tag::LevelSize
            | Tag::ChannelSize
            | Tag::PeakTableOffsetLow
            | Tag::PeakTableOffsetHigh
            | Tag::PeakLevel
            | Tag::BandSecondPass
            | Tag::BandCodingFlags => {}

            _ => {
                warn!("metadata tag {:?} out of context", tag);
            }
        }

        Ok(())
    }

    // Allocate the transform for one channel from the header state.
    fn open_channel(&self) -> Result<ChannelDecode, CodecError> {
        let mut transform = Transform::allocate(
            self.state.transform_type,
            self.state.frame_width,
            self.state.frame_height,
            self.state.num_frames,
            self.state.num_spatial,
        )?;

        transform.prescale = match self.prescale_override {
            Some(packed) => quant::unpack_prescale(packed),
            None => quant::default_prescale(self.state.transform_type, self.state.precision),
        };

        // The transmitted structure must agree with the reconstruction
        if self.state.num_wavelets != 0 && transform.num_wavelets != self.state.num_wavelets {
            return Err(CodecError::BadTag {
                tag: Tag::NumWavelets.value(),
                value: self.state.num_wavelets as u16,
            });
        }
        if self.state.num_subbands != 0 && transform.subband_count() != self.state.num_subbands {
            return Err(CodecError::BadTag {
                tag: Tag::NumSubbands.value(),
                value: self.state.num_subbands as u16,
            });
        }

        Ok(ChannelDecode {
            transform,
            next_wavelet: 0,
            lowpass_seen: false,
        })
    }

    // Parse the lowpass header and read the raw lowpass coefficients
    // into the apex wavelet.
    fn decode_lowpass(
        &self,
        stream: &mut BitReader,
        channel: &mut ChannelDecode,
        subband: u16,
    ) -> Result<(), CodecError> {
        info!(
            "lowpass subband {} at byte offset {}",
            subband,
            stream.byte_position()
        );

        if subband != 0 {
            return Err(CodecError::BadTag {
                tag: Tag::LowpassSubband.value(),
                value: subband,
            });
        }

        let level = stream.get_value(Tag::NumLevels.value());
        let width = stream.get_value(Tag::LowpassWidth.value()) as usize;
        let height = stream.get_value(Tag::LowpassHeight.value()) as usize;

        let _margin_left = stream.get_value(Tag::MarginLeft.value());
        let _margin_top = stream.get_value(Tag::MarginTop.value());
        let _margin_right = stream.get_value(Tag::MarginRight.value());
        let _margin_bottom = stream.get_value(Tag::MarginBottom.value());

        let _pixel_offset = stream.get_value(Tag::PixelOffset.value());
        let quantization = stream.get_value(Tag::Quantization.value());
        let _pixel_depth = stream.get_value(Tag::PixelDepth.value());
        check_stream(stream)?;

        // The subband size tag was promoted to optional when patched.
        // Exactly one segment is consumed; the raw coefficients follow.
        let _ = stream.get_tag_optional();

        let apex = channel.transform.apex_wavelet();
        let wavelet = &mut channel.transform.wavelets[apex];

        if width != wavelet.width || height != wavelet.height {
            return Err(CodecError::InvalidDimension { width, height });
        }
        if level as usize != wavelet.level {
            return Err(CodecError::HighpassIndex {
                expected: wavelet.level as u16,
                actual: level,
            });
        }

        wavelet.quant[LL_BAND] = quantization.max(1);

        let pitch = wavelet.pitch_units();
        let data = wavelet.band_mut(LL_BAND);
        for row in 0..height {
            for column in 0..width {
                data[row * pitch + column] = stream.get_word_16s() as i16;
            }
        }
        check_stream(stream)?;

        // Step over the padding to the next tag boundary
        stream.align_bits_tag();

        channel.lowpass_seen = true;
        Ok(())
    }

    // Parse the highpass wavelet header and verify it is consistent
    // with the decoder's position in the pyramid.
    fn decode_highpass_header(
        &self,
        stream: &mut BitReader,
        channel: &mut ChannelDecode,
        wavelet_type: u16,
    ) -> Result<(), CodecError> {
        let number = stream.get_value(Tag::WaveletNumber.value());
        let level = stream.get_value(Tag::WaveletLevel.value());
        let num_bands = stream.get_value(Tag::NumBands.value());
        let width = stream.get_value(Tag::HighpassWidth.value()) as usize;
        let height = stream.get_value(Tag::HighpassHeight.value()) as usize;
        let _lowpass_border = stream.get_value(Tag::LowpassBorder.value());
        let _highpass_border = stream.get_value(Tag::HighpassBorder.value());
        let lowpass_scale = stream.get_value(Tag::LowpassScale.value());
        let lowpass_divisor = stream.get_value(Tag::LowpassDivisor.value());
        check_stream(stream)?;

        debug!(
            "highpass wavelet {} level {} with {} bands at byte offset {}",
            number,
            level,
            num_bands,
            stream.byte_position()
        );

        let index = number as usize;
        if index < channel.next_wavelet || index >= channel.transform.num_wavelets {
            return Err(CodecError::HighpassIndex {
                expected: channel.next_wavelet as u16,
                actual: number,
            });
        }

        let wavelet = &mut channel.transform.wavelets[index];
        if wavelet.level != level as usize || wavelet.wavelet_type.value() != wavelet_type {
            return Err(CodecError::HighpassIndex {
                expected: wavelet.level as u16,
                actual: level,
            });
        }
        if wavelet.width != width || wavelet.height != height {
            return Err(CodecError::InvalidDimension { width, height });
        }

        wavelet.scale[LL_BAND] = lowpass_scale as u32;
        wavelet.quant[LL_BAND] = lowpass_divisor.max(1);

        channel.next_wavelet = index + 1;
        Ok(())
    }

    // Parse a band header, scan the coefficients to the band end, and
    // dequantize the band in place.
    fn decode_band(
        &self,
        stream: &mut BitReader,
        channel: &mut ChannelDecode,
        band_number: u16,
    ) -> Result<(), CodecError> {
        let width = stream.get_value(Tag::BandWidth.value()) as usize;
        let height = stream.get_value(Tag::BandHeight.value()) as usize;
        let subband = stream.get_value(Tag::BandSubband.value()) as usize;
        let encoding = stream.get_value(Tag::BandEncoding.value());
        let quantization = stream.get_value(Tag::BandQuantization.value());
        let scale = stream.get_value(Tag::BandScale.value());
        check_stream(stream)?;

        // The band header delimiter introduces the coefficients; the
        // patched subband size segment before it is optional and is
        // skipped on the way
        let _ = stream.get_value(Tag::BandHeader.value());
        check_stream(stream)?;

        debug!(
            "band {} subband {} quant {} at byte offset {}",
            band_number,
            subband,
            quantization,
            stream.byte_position()
        );

        match BandEncoding::from_value(encoding) {
            Some(BandEncoding::RunLengths) => {}
            _ => {
                return Err(CodecError::BadTag {
                    tag: Tag::BandEncoding.value(),
                    value: encoding,
                });
            }
        }

        let map = channel.transform.subband_map();
        let location = *map.get(subband).ok_or(CodecError::BadTag {
            tag: Tag::BandSubband.value(),
            value: subband as u16,
        })?;

        if location.band != band_number as usize {
            return Err(CodecError::BadTag {
                tag: Tag::BandNumber.value(),
                value: band_number,
            });
        }

        let wavelet = &mut channel.transform.wavelets[location.wavelet];
        if wavelet.width != width || wavelet.height != height {
            return Err(CodecError::InvalidDimension { width, height });
        }

        wavelet.quant[location.band] = quantization.max(1);
        wavelet.scale[location.band] = scale as u32;

        let pitch = wavelet.pitch_units();
        vlc::decode_band(
            stream,
            self.codebooks,
            wavelet.band_mut(location.band),
            width,
            height,
            pitch,
        )?;

        // The band end codeword is followed by padding to the next tag
        // boundary and the band trailer
        stream.align_bits_tag();
        let trailer = stream.get_tag_value();
        if !stream.is_valid_segment(trailer, Tag::BandTrailer.value()) {
            return Err(CodecError::MissingMarker {
                tag: Tag::BandTrailer.value(),
            });
        }

        // Dequantization restores the coefficient range; quantization
        // remains the only lossy step
        quant::dequantize_band(
            wavelet.band_mut(location.band),
            width,
            height,
            pitch,
            quantization,
        );

        Ok(())
    }

    // Invert every channel transform and assemble the output group.
    fn finish_group(&mut self, channels: Vec<ChannelDecode>) -> Result<DecodedGroup, CodecError> {
        let mut decoded = Vec::with_capacity(channels.len());

        for channel in channels {
            if !channel.lowpass_seen {
                return Err(CodecError::MissingMarker {
                    tag: Tag::LowpassSubband.value(),
                });
            }
            decoded.push(reconstruct_channel(channel.transform, &mut self.scratch)?);
        }

        Ok(DecodedGroup {
            width: self.state.frame_width,
            height: self.state.frame_height,
            num_frames: self.state.num_frames,
            channels: decoded,
        })
    }
}

// Write a reconstructed plane into its destination, reversing the
// prescale shift of the wavelet that consumed it.
fn write_destination(
    transform: &mut Transform,
    frames: &mut [Vec<i16>],
    source: TransformSource,
    data: &[i16],
    width: usize,
    height: usize,
    shift: u32,
) {
    match source.wavelet {
        None => {
            let frame = &mut frames[source.band];
            for row in 0..height {
                for column in 0..width {
                    let value = (data[row * width + column] as i32) << shift;
                    frame[row * width + column] = filter::saturate16(value);
                }
            }
        }
        Some(index) => {
            let wavelet = &mut transform.wavelets[index];
            let pitch = wavelet.pitch_units();
            debug_assert!(wavelet.width == width && wavelet.height == height);
            let band = wavelet.band_mut(source.band);
            for row in 0..height {
                for column in 0..width {
                    let value = (data[row * width + column] as i32) << shift;
                    band[row * pitch + column] = filter::saturate16(value);
                }
            }
        }
    }
}

// Invert the pyramid from the apex down to the output frames.
fn reconstruct_channel(
    mut transform: Transform,
    scratch: &mut dyn ScratchProvider,
) -> Result<DecodedChannel, CodecError> {
    let width = transform.width;
    let height = transform.height;
    let num_frames = transform.num_frames;

    let mut frames = vec![vec![0i16; width * height]; num_frames];

    for index in (0..transform.num_wavelets).rev() {
        let descriptor = transform.descriptors[index];
        let shift = transform.prescale[index];

        // Copy the bands so the destination may live in the same arena
        let (bands, band_width, band_height) = {
            let wavelet = &transform.wavelets[index];
            let pitch = wavelet.pitch_units();
            let mut bands = Vec::with_capacity(wavelet.num_bands);
            for band in 0..wavelet.num_bands {
                let data = wavelet.band(band);
                let mut packed = scratch.acquire(wavelet.width * wavelet.height);
                for row in 0..wavelet.height {
                    packed[row * wavelet.width..(row + 1) * wavelet.width]
                        .copy_from_slice(&data[row * pitch..row * pitch + wavelet.width]);
                }
                bands.push(packed);
            }
            (bands, wavelet.width, wavelet.height)
        };

        match descriptor.filter {
            FilterKind::Spatial => {
                let out_width = band_width * 2;
                let out_height = band_height * 2;
                let mut output = scratch.acquire(out_width * out_height);
                filter::inverse_spatial(
                    [&bands[0], &bands[1], &bands[2], &bands[3]],
                    band_width,
                    band_width,
                    band_height,
                    &mut output,
                    out_width,
                );
                write_destination(
                    &mut transform,
                    &mut frames,
                    descriptor.source1,
                    &output,
                    out_width,
                    out_height,
                    shift,
                );
                scratch.release(output);
            }
            FilterKind::Interlaced => {
                let out_width = band_width * 2;
                let out_height = band_height * 2;
                let mut output = scratch.acquire(out_width * out_height);
                filter::inverse_frame(
                    [&bands[0], &bands[1], &bands[2], &bands[3]],
                    band_width,
                    band_width,
                    band_height,
                    &mut output,
                    out_width,
                );
                write_destination(
                    &mut transform,
                    &mut frames,
                    descriptor.source1,
                    &output,
                    out_width,
                    out_height,
                    shift,
                );
                scratch.release(output);
            }
            FilterKind::Temporal => {
                let source2 = descriptor.source2.ok_or(CodecError::BadAccess)?;
                let mut output0 = scratch.acquire(band_width * band_height);
                let mut output1 = scratch.acquire(band_width * band_height);
                filter::inverse_temporal(
                    &bands[0],
                    band_width,
                    &bands[1],
                    band_width,
                    band_width,
                    band_height,
                    &mut output0,
                    band_width,
                    &mut output1,
                    band_width,
                );
                write_destination(
                    &mut transform,
                    &mut frames,
                    descriptor.source1,
                    &output0,
                    band_width,
                    band_height,
                    shift,
                );
                write_destination(
                    &mut transform,
                    &mut frames,
                    source2,
                    &output1,
                    band_width,
                    band_height,
                    shift,
                );
                scratch.release(output0);
                scratch.release(output1);
            }
            FilterKind::Unspecified => return Err(CodecError::BadAccess),
        }

        for band in bands {
            scratch.release(band);
        }
    }

    Ok(DecodedChannel {
        width,
        height,
        frames,
    })
}
