//! Wavelet image and transform data model.
//!
//! There are several types of wavelet. The most common is the spatial
//! wavelet with four bands: one lowpass band and three highpass bands
//! (horizontal, vertical, and diagonal). Two band wavelets come from a
//! transform applied in only one dimension and store the lowpass result
//! in band zero and the highpass result in band one. Temporal-horizontal
//! wavelets store the bands in the order lowpass, horizontal highpass,
//! temporal highpass, and diagonal.
//!
//! A transform owns the ordered array of wavelets that forms the
//! pyramid for one color channel. Wavelets reference each other by
//! index into that array; the descriptor table records the filter that
//! produced each wavelet and its source bands, and is the ground truth
//! for both the encode order and the decode order.

use crate::{CodecError, MAX_WAVELETS};

/// Number of result bands in a four band wavelet.
pub const IMAGE_NUM_BANDS: usize = 4;

/// Row strides are rounded up to this many bytes.
pub const CACHE_LINE_SIZE: usize = 16;

/// Maximum sum of pyramid level and pending spatial transforms.
pub const MAX_PYRAMID_DEPTH: usize = 8;

// Result bands for the spatial and temporal-horizontal transforms
pub const LL_BAND: usize = 0; // Lowpass transform of lowpass intermediate
pub const LH_BAND: usize = 1; // Lowpass transform of highpass intermediate
pub const HL_BAND: usize = 2; // Highpass transform of lowpass intermediate
pub const HH_BAND: usize = 3; // Highpass transform of highpass intermediate

// Result bands for the two band wavelet transforms
pub const LOWPASS_BAND: usize = 0;
pub const HIGHPASS_BAND: usize = 1;

/// The type of filtering that produced a wavelet.
///
/// The bits of the type code record which dimensions were filtered;
/// the number of one bits distinguishes two band wavelets from four
/// band wavelets. The quad variants exist for development only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveletType {
    Image,
    Horizontal,
    Vertical,
    Spatial,
    Temporal,
    HorizontalTemporal,
    VerticalTemporal,
    TemporalQuad,
    HorizontalQuad,
}

impl WaveletType {
    pub fn from_value(value: u16) -> Option<WaveletType> {
        match value {
            0 => Some(WaveletType::Image),
            1 => Some(WaveletType::Horizontal),
            2 => Some(WaveletType::Vertical),
            3 => Some(WaveletType::Spatial),
            4 => Some(WaveletType::Temporal),
            5 => Some(WaveletType::HorizontalTemporal),
            6 => Some(WaveletType::VerticalTemporal),
            8 => Some(WaveletType::TemporalQuad),
            9 => Some(WaveletType::HorizontalQuad),
            _ => None,
        }
    }

    pub fn value(self) -> u16 {
        match self {
            WaveletType::Image => 0,
            WaveletType::Horizontal => 1,
            WaveletType::Vertical => 2,
            WaveletType::Spatial => 3,
            WaveletType::Temporal => 4,
            WaveletType::HorizontalTemporal => 5,
            WaveletType::VerticalTemporal => 6,
            WaveletType::TemporalQuad => 8,
            WaveletType::HorizontalQuad => 9,
        }
    }

    /// Number of bands allocated for a wavelet of this type.
    pub fn num_bands(self) -> usize {
        match self {
            WaveletType::Image => 1,
            WaveletType::Horizontal | WaveletType::Vertical | WaveletType::Temporal => 2,
            WaveletType::Spatial
            | WaveletType::HorizontalTemporal
            | WaveletType::VerticalTemporal
            | WaveletType::TemporalQuad
            | WaveletType::HorizontalQuad => IMAGE_NUM_BANDS,
        }
    }
}

/// Organisation of the wavelet pyramid for one group of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformType {
    /// No temporal wavelets; a chain of spatial transforms per frame.
    Spatial,

    /// Frames organized by field with a temporal transform between the
    /// per-frame lowpass bands.
    Field,

    /// The field transform with an additional spatial wavelet over the
    /// temporal highpass band.
    FieldPlus,

    /// Progressive frames with per-frame spatial bases.
    Frame,

    /// Fields combined into interlaced frames; the base wavelet mixes
    /// a temporal step between the fields with a horizontal step.
    Interlaced,
}

impl TransformType {
    pub fn from_value(value: u16) -> Option<TransformType> {
        match value {
            0 => Some(TransformType::Spatial),
            1 => Some(TransformType::Field),
            2 => Some(TransformType::FieldPlus),
            3 => Some(TransformType::Frame),
            4 => Some(TransformType::Interlaced),
            _ => None,
        }
    }

    pub fn value(self) -> u16 {
        match self {
            TransformType::Spatial => 0,
            TransformType::Field => 1,
            TransformType::FieldPlus => 2,
            TransformType::Frame => 3,
            TransformType::Interlaced => 4,
        }
    }
}

/// Storage state of one band, so release is unambiguous.
#[derive(Debug)]
enum BandStorage {
    /// The band lives in the wavelet's shared memory block.
    Shared { offset: usize },

    /// The band was materialized after the initial allocation.
    Separate(Vec<i16>),
}

/// A multi-band image of 16-bit signed coefficients.
///
/// The lowpass band of a lowpass-only wavelet stores values in the
/// unsigned 16-bit range after prescaling; all other bands store
/// signed residuals. The row stride is identical for all bands.
#[derive(Debug)]
pub struct WaveletImage {
    /// Width of each band in coefficients.
    pub width: usize,

    /// Height of each band in rows.
    pub height: usize,

    /// Distance between rows in bytes, rounded up to a cache line.
    pub pitch: usize,

    /// Level in the pyramid (zero is full resolution).
    pub level: usize,

    pub wavelet_type: WaveletType,

    pub num_bands: usize,

    /// Quantization divisor actually applied to each band.
    pub quant: [u16; IMAGE_NUM_BANDS],

    /// Cumulative amplitude scale introduced by filtering, needed to
    /// rescale the final lowpass band for display.
    pub scale: [u32; IMAGE_NUM_BANDS],

    // Shared memory block holding the initially allocated bands
    block: Vec<i16>,

    bands: Vec<BandStorage>,
}

impl WaveletImage {
    /// Allocate storage for a wavelet with each band width by height.
    pub fn new(
        width: usize,
        height: usize,
        level: usize,
        wavelet_type: WaveletType,
    ) -> Result<WaveletImage, CodecError> {
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidDimension { width, height });
        }

        let num_bands = wavelet_type.num_bands();
        let pitch = round_up_pitch(width);
        let band_units = (pitch / 2) * height;

        let block = vec![0i16; band_units * num_bands];
        let bands = (0..num_bands)
            .map(|band| BandStorage::Shared {
                offset: band * band_units,
            })
            .collect();

        Ok(WaveletImage {
            width,
            height,
            pitch,
            level,
            wavelet_type,
            num_bands,
            quant: [1; IMAGE_NUM_BANDS],
            scale: [1; IMAGE_NUM_BANDS],
            block,
            bands,
        })
    }

    /// Row stride in coefficients.
    pub fn pitch_units(&self) -> usize {
        self.pitch / 2
    }

    /// Lazily create an additional band outside the shared block.
    pub fn allocate_band(&mut self, band: usize) {
        let band_units = self.pitch_units() * self.height;
        while self.bands.len() <= band {
            self.bands.push(BandStorage::Separate(vec![0i16; band_units]));
            self.num_bands = self.bands.len();
        }
    }

    pub fn band(&self, band: usize) -> &[i16] {
        let band_units = self.pitch_units() * self.height;
        match &self.bands[band] {
            BandStorage::Shared { offset } => &self.block[*offset..*offset + band_units],
            BandStorage::Separate(data) => &data[..],
        }
    }

    pub fn band_mut(&mut self, band: usize) -> &mut [i16] {
        let band_units = self.pitch_units() * self.height;
        match &mut self.bands[band] {
            BandStorage::Shared { offset } => {
                let offset = *offset;
                &mut self.block[offset..offset + band_units]
            }
            BandStorage::Separate(data) => &mut data[..],
        }
    }

    /// Mutable views of all bands in the shared block at once, for the
    /// transform kernels that write every band of one wavelet.
    ///
    /// Only valid while every band still lives in the shared block.
    pub fn shared_bands_mut(&mut self) -> Vec<&mut [i16]> {
        debug_assert!(self
            .bands
            .iter()
            .all(|band| matches!(band, BandStorage::Shared { .. })));

        let band_units = self.pitch_units() * self.height;
        let num_bands = self.num_bands;
        self.block
            .chunks_mut(band_units)
            .take(num_bands)
            .collect()
    }

}

fn round_up_pitch(width: usize) -> usize {
    let bytes = width * std::mem::size_of::<i16>();
    let line = CACHE_LINE_SIZE.max(16);
    (bytes + line - 1) / line * line
}

/// Counts and extrema of the coefficients in one band.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImageStatistics {
    pub positive: usize,
    pub negative: usize,
    pub zero: usize,
    pub minimum: i16,
    pub maximum: i16,
}

/// Compute the coefficient statistics for one band.
pub fn compute_band_statistics(image: &WaveletImage, band: usize) -> ImageStatistics {
    let mut stats = ImageStatistics::default();
    let data = image.band(band);
    let pitch = image.pitch_units();

    for row in 0..image.height {
        for &value in &data[row * pitch..row * pitch + image.width] {
            if value > 0 {
                stats.positive += 1;
            } else if value < 0 {
                stats.negative += 1;
            } else {
                stats.zero += 1;
            }
            if value < stats.minimum {
                stats.minimum = value;
            }
            if value > stats.maximum {
                stats.maximum = value;
            }
        }
    }

    stats
}

/// Type of transform filter recorded in the transform descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Unspecified,

    /// Four band horizontal and vertical transform of one source band.
    Spatial,

    /// Two band transform between two aligned source bands.
    Temporal,

    /// Temporal step between the fields of one frame combined with a
    /// horizontal step.
    Interlaced,
}

/// Source of one wavelet in the pyramid.
///
/// The pyramid is a fixed-size array and cross-wavelet references are
/// integer indices into that array; `wavelet == None` refers to an
/// input frame, with `band` selecting the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformSource {
    pub wavelet: Option<usize>,
    pub band: usize,
}

/// Descriptor for the filter that produced one wavelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformDescriptor {
    pub filter: FilterKind,
    pub source1: TransformSource,
    pub source2: Option<TransformSource>,
}

/// Location of an encoded subband within the pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubbandLocation {
    pub wavelet: usize,
    pub band: usize,
}

/// The spatio-temporal wavelet transform for one color channel.
#[derive(Debug)]
pub struct Transform {
    pub transform_type: TransformType,

    /// Number of frames aggregated into the group (1 or 2).
    pub num_frames: usize,

    /// Number of levels in the wavelet pyramid.
    pub num_levels: usize,

    pub num_wavelets: usize,

    /// Number of purely spatial wavelets in the pyramid.
    pub num_spatial: usize,

    /// Dimensions of the original frame.
    pub width: usize,
    pub height: usize,

    /// Prescale shift applied to each wavelet's input before filtering.
    pub prescale: [u32; MAX_WAVELETS],

    pub wavelets: Vec<WaveletImage>,

    /// The filter and sources that produced each wavelet; ground truth
    /// for both the encode order and the decode order.
    pub descriptors: Vec<TransformDescriptor>,
}

impl Transform {
    /// Allocate the wavelet pyramid for the specified organisation.
    pub fn allocate(
        transform_type: TransformType,
        width: usize,
        height: usize,
        num_frames: usize,
        num_spatial: usize,
    ) -> Result<Transform, CodecError> {
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidDimension { width, height });
        }
        if num_spatial == 0 || num_spatial > MAX_WAVELETS {
            return Err(CodecError::InvalidDimension {
                width: num_spatial,
                height: 0,
            });
        }

        let mut transform = Transform {
            transform_type,
            num_frames,
            num_levels: 0,
            num_wavelets: 0,
            num_spatial,
            width,
            height,
            prescale: [0; MAX_WAVELETS],
            wavelets: Vec::new(),
            descriptors: Vec::new(),
        };

        match transform_type {
            TransformType::Spatial => transform.allocate_spatial()?,
            TransformType::Interlaced => transform.allocate_interlaced()?,
            TransformType::Field => transform.allocate_field(false)?,
            TransformType::FieldPlus => transform.allocate_field(true)?,
            TransformType::Frame => transform.allocate_frame()?,
        }

        transform.num_wavelets = transform.wavelets.len();
        if transform.num_wavelets > MAX_WAVELETS {
            return Err(CodecError::InvalidDimension {
                width: transform.num_wavelets,
                height: 0,
            });
        }
        transform.num_levels = transform
            .wavelets
            .iter()
            .map(|wavelet| wavelet.level)
            .max()
            .unwrap_or(0);

        // The pyramid depth invariant bounds every wavelet
        for wavelet in transform.wavelets.iter() {
            if wavelet.level + num_spatial > MAX_PYRAMID_DEPTH {
                return Err(CodecError::InvalidDimension {
                    width: wavelet.level,
                    height: num_spatial,
                });
            }
        }

        Ok(transform)
    }

    fn push_wavelet(
        &mut self,
        width: usize,
        height: usize,
        level: usize,
        wavelet_type: WaveletType,
        descriptor: TransformDescriptor,
    ) -> Result<usize, CodecError> {
        let wavelet = WaveletImage::new(width, height, level, wavelet_type)?;
        self.wavelets.push(wavelet);
        self.descriptors.push(descriptor);
        Ok(self.wavelets.len() - 1)
    }

    fn frame_source(frame: usize) -> TransformSource {
        TransformSource {
            wavelet: None,
            band: frame,
        }
    }

    fn band_source(wavelet: usize, band: usize) -> TransformSource {
        TransformSource {
            wavelet: Some(wavelet),
            band,
        }
    }

    // A chain of spatial wavelets from the frame
    fn allocate_spatial(&mut self) -> Result<(), CodecError> {
        let levels = self.num_spatial;
        require_divisible(self.width, self.height, 1 << levels)?;

        let mut source = Self::frame_source(0);
        let mut width = self.width;
        let mut height = self.height;

        for level in 1..=levels {
            width /= 2;
            height /= 2;
            let index = self.push_wavelet(
                width,
                height,
                level,
                WaveletType::Spatial,
                TransformDescriptor {
                    filter: FilterKind::Spatial,
                    source1: source,
                    source2: None,
                },
            )?;
            source = Self::band_source(index, LL_BAND);
        }

        Ok(())
    }

    // The base wavelet combines a temporal step between the two fields
    // of the frame with a horizontal step; spatial wavelets follow.
    fn allocate_interlaced(&mut self) -> Result<(), CodecError> {
        require_divisible(self.width, self.height, 2 << self.num_spatial)?;

        let base = self.push_wavelet(
            self.width / 2,
            self.height / 2,
            1,
            WaveletType::HorizontalTemporal,
            TransformDescriptor {
                filter: FilterKind::Interlaced,
                source1: Self::frame_source(0),
                source2: None,
            },
        )?;

        self.append_spatial_chain(Self::band_source(base, LL_BAND), self.width / 2, self.height / 2, 1)?;
        Ok(())
    }

    // Two per-frame interlaced wavelets, a temporal wavelet between
    // their lowpass bands, then spatial wavelets over the temporal
    // lowpass; fieldplus adds one spatial over the temporal highpass.
    fn allocate_field(&mut self, decompose_highpass: bool) -> Result<(), CodecError> {
        if self.num_frames != 2 {
            return Err(CodecError::InvalidDimension {
                width: self.num_frames,
                height: 0,
            });
        }
        if decompose_highpass && self.num_spatial < 2 {
            return Err(CodecError::InvalidDimension {
                width: self.num_spatial,
                height: 0,
            });
        }
        require_divisible(self.width, self.height, 4 << self.num_spatial)?;

        let half_width = self.width / 2;
        let half_height = self.height / 2;

        let frame0 = self.push_wavelet(
            half_width,
            half_height,
            1,
            WaveletType::HorizontalTemporal,
            TransformDescriptor {
                filter: FilterKind::Interlaced,
                source1: Self::frame_source(0),
                source2: None,
            },
        )?;
        let frame1 = self.push_wavelet(
            half_width,
            half_height,
            1,
            WaveletType::HorizontalTemporal,
            TransformDescriptor {
                filter: FilterKind::Interlaced,
                source1: Self::frame_source(1),
                source2: None,
            },
        )?;

        let temporal = self.push_wavelet(
            half_width,
            half_height,
            2,
            WaveletType::Temporal,
            TransformDescriptor {
                filter: FilterKind::Temporal,
                source1: Self::band_source(frame0, LL_BAND),
                source2: Some(Self::band_source(frame1, LL_BAND)),
            },
        )?;

        // The spatial over the temporal highpass counts towards the
        // spatial wavelet total, so the lowpass chain is one shorter
        let mut chain = self.num_spatial;
        if decompose_highpass {
            // One spatial wavelet over the temporal highpass band
            self.push_wavelet(
                half_width / 2,
                half_height / 2,
                3,
                WaveletType::Spatial,
                TransformDescriptor {
                    filter: FilterKind::Spatial,
                    source1: Self::band_source(temporal, HIGHPASS_BAND),
                    source2: None,
                },
            )?;
            chain -= 1;
        }

        self.append_spatial_chain_steps(
            Self::band_source(temporal, LOWPASS_BAND),
            half_width,
            half_height,
            2,
            chain,
        )?;
        Ok(())
    }

    // Progressive frames: per-frame spatial bases instead of the
    // interlaced base wavelets.
    fn allocate_frame(&mut self) -> Result<(), CodecError> {
        if self.num_frames != 2 {
            return Err(CodecError::InvalidDimension {
                width: self.num_frames,
                height: 0,
            });
        }
        if self.num_spatial < 2 {
            return Err(CodecError::InvalidDimension {
                width: self.num_spatial,
                height: 0,
            });
        }
        require_divisible(self.width, self.height, 4 << self.num_spatial)?;

        let half_width = self.width / 2;
        let half_height = self.height / 2;

        let frame0 = self.push_wavelet(
            half_width,
            half_height,
            1,
            WaveletType::Spatial,
            TransformDescriptor {
                filter: FilterKind::Spatial,
                source1: Self::frame_source(0),
                source2: None,
            },
        )?;
        let frame1 = self.push_wavelet(
            half_width,
            half_height,
            1,
            WaveletType::Spatial,
            TransformDescriptor {
                filter: FilterKind::Spatial,
                source1: Self::frame_source(1),
                source2: None,
            },
        )?;

        let temporal = self.push_wavelet(
            half_width,
            half_height,
            2,
            WaveletType::Temporal,
            TransformDescriptor {
                filter: FilterKind::Temporal,
                source1: Self::band_source(frame0, LL_BAND),
                source2: Some(Self::band_source(frame1, LL_BAND)),
            },
        )?;

        // One spatial wavelet over the temporal highpass band
        self.push_wavelet(
            half_width / 2,
            half_height / 2,
            3,
            WaveletType::Spatial,
            TransformDescriptor {
                filter: FilterKind::Spatial,
                source1: Self::band_source(temporal, HIGHPASS_BAND),
                source2: None,
            },
        )?;

        self.append_spatial_chain_steps(
            Self::band_source(temporal, LOWPASS_BAND),
            half_width,
            half_height,
            2,
            self.num_spatial - 1,
        )?;
        Ok(())
    }

    // Append the chain of spatial wavelets that refines the lowpass
    // band down to the pyramid apex.
    fn append_spatial_chain(
        &mut self,
        source: TransformSource,
        width: usize,
        height: usize,
        base_level: usize,
    ) -> Result<(), CodecError> {
        let steps = self.num_spatial;
        self.append_spatial_chain_steps(source, width, height, base_level, steps)
    }

    fn append_spatial_chain_steps(
        &mut self,
        source: TransformSource,
        width: usize,
        height: usize,
        base_level: usize,
        steps: usize,
    ) -> Result<(), CodecError> {
        let mut source = source;
        let mut width = width;
        let mut height = height;

        for step in 1..=steps {
            width /= 2;
            height /= 2;
            let index = self.push_wavelet(
                width,
                height,
                base_level + step,
                WaveletType::Spatial,
                TransformDescriptor {
                    filter: FilterKind::Spatial,
                    source1: source,
                    source2: None,
                },
            )?;
            source = Self::band_source(index, LL_BAND);
        }

        Ok(())
    }

    /// Is the band consumed as the source of a later wavelet?
    pub fn is_band_consumed(&self, wavelet: usize, band: usize) -> bool {
        self.descriptors.iter().any(|descriptor| {
            let source = Self::band_source(wavelet, band);
            descriptor.source1 == source || descriptor.source2 == Some(source)
        })
    }

    /// Index of the wavelet at the apex of the pyramid: the wavelet
    /// whose lowpass band is not decomposed any further.
    pub fn apex_wavelet(&self) -> usize {
        for index in (0..self.wavelets.len()).rev() {
            if !self.is_band_consumed(index, LL_BAND) {
                return index;
            }
        }
        self.wavelets.len().saturating_sub(1)
    }

    /// Locations of the encoded subbands in emission order.
    ///
    /// Subband zero is the apex lowpass band; the highpass bands
    /// follow, walking the wavelet array in index order. A band is
    /// encoded if and only if no later wavelet consumes it.
    pub fn subband_map(&self) -> Vec<SubbandLocation> {
        let apex = self.apex_wavelet();
        let mut map = vec![SubbandLocation {
            wavelet: apex,
            band: LL_BAND,
        }];

        for wavelet in 0..self.wavelets.len() {
            for band in 0..self.wavelets[wavelet].num_bands {
                if wavelet == apex && band == LL_BAND {
                    continue;
                }
                if !self.is_band_consumed(wavelet, band) {
                    map.push(SubbandLocation { wavelet, band });
                }
            }
        }

        map
    }

    /// Number of encoded subbands in the transform.
    pub fn subband_count(&self) -> usize {
        self.subband_map().len()
    }

    /// The wavelet type of the first wavelet computed from the frames.
    pub fn first_wavelet_type(&self) -> WaveletType {
        self.wavelets
            .first()
            .map(|wavelet| wavelet.wavelet_type)
            .unwrap_or(WaveletType::Image)
    }
}

fn require_divisible(width: usize, height: usize, factor: usize) -> Result<(), CodecError> {
    if width % factor != 0 || height % factor != 0 {
        return Err(CodecError::InvalidDimension { width, height });
    }
    Ok(())
}

/// Provider of scratch coefficient buffers for the transform kernels.
///
/// Host environments can substitute their own allocation policy; the
/// default provider recycles heap buffers.
pub trait ScratchProvider {
    /// Hand out a zero-filled buffer of at least the requested length.
    fn acquire(&mut self, units: usize) -> Vec<i16>;

    /// Return a buffer for reuse.
    fn release(&mut self, buffer: Vec<i16>);
}

/// Heap-backed scratch provider that recycles released buffers.
#[derive(Debug, Default)]
pub struct HeapScratch {
    free: Vec<Vec<i16>>,
}

impl HeapScratch {
    pub fn new() -> Self {
        HeapScratch::default()
    }
}

impl ScratchProvider for HeapScratch {
    fn acquire(&mut self, units: usize) -> Vec<i16> {
        match self.free.iter().position(|buffer| buffer.capacity() >= units) {
            Some(index) => {
                let mut buffer = self.free.swap_remove(index);
                buffer.clear();
                buffer.resize(units, 0);
                buffer
            }
            None => create_image_buffer(units, 1),
        }
    }

    fn release(&mut self, buffer: Vec<i16>) {
        self.free.push(buffer);
    }
}

/// Aligned scratch allocation sized by pitch and height.
pub fn create_image_buffer(pitch_units: usize, height: usize) -> Vec<i16> {
    vec![0i16; pitch_units * height]
}

/// Free and reallocate a scratch buffer; the contents are not
/// preserved.
pub fn realloc_image_buffer(buffer: Vec<i16>, pitch_units: usize, height: usize) -> Vec<i16> {
    drop(buffer);
    create_image_buffer(pitch_units, height)
}
