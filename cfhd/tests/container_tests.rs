//! Tag-value container scenarios: optional tag skipping, nested chunk
//! sizes, and sample rejection on unknown required tags.

use bitstream::{BitReader, BitWriter, TagValue};
use cfhd::codebook::Codebooks;
use cfhd::{
    ChannelInput, CodecError, Decoder, Encoder, EncoderParams, SampleType, Tag, TransformType,
};

// A tag that no decoder of this catalog recognizes
const UNKNOWN_TAG: i16 = 999;

#[test]
fn test_reader_skips_unrecognized_optional_tags() {
    // Segment sequence with an optional tag in the middle; a reader
    // that does not recognize it must see only the required segments
    let mut buffer = vec![0u8; 64];
    {
        let mut stream = BitWriter::new(&mut buffer);
        stream.put_tag_pair(Tag::Sample.value(), SampleType::Group.value());
        stream.put_tag_pair(Tag::NumFrames.value(), 2);
        stream.put_tag_pair(Tag::NumChannels.value(), 3);
        stream.put_tag_pair_optional(UNKNOWN_TAG, 1);
        stream.put_tag_pair(Tag::TransformType.value(), 2);
    }

    let mut reader = BitReader::new(&buffer);
    let mut required: Vec<TagValue> = Vec::new();
    for _ in 0..4 {
        required.push(reader.get_tag_value());
    }

    assert!(reader.error().is_none());
    assert_eq!(
        required,
        vec![
            TagValue { tag: Tag::Sample.value(), value: SampleType::Group.value() },
            TagValue { tag: Tag::NumFrames.value(), value: 2 },
            TagValue { tag: Tag::NumChannels.value(), value: 3 },
            TagValue { tag: Tag::TransformType.value(), value: 2 },
        ]
    );
}

#[test]
fn test_optional_tags_accepted_in_any_order() {
    let mut buffer = vec![0u8; 64];
    {
        let mut stream = BitWriter::new(&mut buffer);
        stream.put_tag_pair_optional(Tag::QualityHigh.value(), 0);
        stream.put_tag_pair_optional(UNKNOWN_TAG, 7);
        stream.put_tag_pair_optional(Tag::QualityLow.value(), 3);
        stream.put_tag_pair(Tag::NumFrames.value(), 1);
    }

    let mut reader = BitReader::new(&buffer);
    assert_eq!(reader.get_value(Tag::NumFrames.value()), 1);
    assert!(reader.error().is_none());
}

#[test]
fn test_nested_chunk_sizes_lifo() {
    // Open chunks A, B, C in that order, close them C, B, A with 12,
    // 20 and 40 bytes after each chunk tag; the patched sizes read
    // back as bytes divided by four, less one
    let mut buffer = vec![0u8; 128];
    {
        let mut stream = BitWriter::new(&mut buffer);
        stream.size_tag_push(Tag::SubbandSize.value()); // A
        stream.put_tag_pair(Tag::Marker.value(), 0);
        stream.size_tag_push(Tag::LevelSize.value()); // B
        stream.put_tag_pair(Tag::Marker.value(), 1);
        stream.size_tag_push(Tag::SubbandSize.value()); // C
        stream.put_tag_pair(Tag::Marker.value(), 2);
        stream.put_tag_pair(Tag::Marker.value(), 3);
        stream.put_tag_pair(Tag::Marker.value(), 4);
        stream.size_tag_pop(); // C holds 12 bytes
        stream.size_tag_pop(); // B holds 20 bytes
        stream.put_tag_pair(Tag::Marker.value(), 5);
        stream.put_tag_pair(Tag::Marker.value(), 6);
        stream.put_tag_pair(Tag::Marker.value(), 7);
        stream.size_tag_pop(); // A holds 40 bytes
    }

    let mut reader = BitReader::new(&buffer);

    let chunk_a = reader.get_segment();
    assert!(chunk_a.is_optional());
    assert_eq!(chunk_a.value, 40 / 4 - 1);

    let _ = reader.get_segment(); // marker 0
    let chunk_b = reader.get_segment();
    assert!(chunk_b.is_optional());
    assert_eq!(chunk_b.value, 20 / 4 - 1);

    let _ = reader.get_segment(); // marker 1
    let chunk_c = reader.get_segment();
    assert!(chunk_c.is_optional());
    assert_eq!(chunk_c.value, 12 / 4 - 1);
}

#[test]
fn test_chunk_tags_are_skippable_after_patching() {
    // A patched chunk tag is optional, so a decoder that does not use
    // chunk sizes can read straight through the chunk header
    let mut buffer = vec![0u8; 64];
    {
        let mut stream = BitWriter::new(&mut buffer);
        stream.size_tag_push(Tag::SubbandSize.value());
        stream.put_tag_pair(Tag::Marker.value(), 42);
        stream.size_tag_pop();
    }

    let mut reader = BitReader::new(&buffer);
    let marker = reader.get_tag_value();
    assert_eq!(marker.tag, Tag::Marker.value());
    assert_eq!(marker.value, 42);
}

#[test]
fn test_group_index_holds_channel_sizes() {
    let books = Codebooks::init().unwrap();
    let params = EncoderParams {
        transform_type: TransformType::FieldPlus,
        gop_length: 2,
        num_spatial: 3,
        quality: 5,
        ..EncoderParams::default()
    };
    let mut encoder = Encoder::new(&books, params).unwrap();

    let frame: Vec<i16> = (0..64 * 64).map(|index| (index % 251) as i16).collect();
    let channels = [
        ChannelInput { width: 64, height: 64, frames: vec![&frame, &frame] },
        ChannelInput { width: 64, height: 64, frames: vec![&frame, &frame] },
    ];

    let mut buffer = vec![0u8; 1 << 20];
    let used;
    {
        let mut stream = BitWriter::new(&mut buffer);
        encoder.encode_group(&mut stream, &channels).unwrap();
        used = stream.byte_count();
    }

    let mut reader = BitReader::new(&buffer[..used]);
    let sample = reader.get_tag_value();
    assert_eq!(sample.value, SampleType::Group.value());

    let index = reader.get_tag_value();
    assert_eq!(index.tag, Tag::Index.value());
    assert_eq!(index.value, 2);

    // Both channel sizes were back-patched and account for the whole
    // of the per-channel payload
    let size0 = reader.get_long() as usize;
    let size1 = reader.get_long() as usize;
    assert!(size0 > 0 && size0 % 4 == 0);
    assert!(size1 > 0 && size1 % 4 == 0);
    assert!(size0 + size1 < used);
}

#[test]
fn test_unknown_required_tag_rejects_the_sample() {
    let books = Codebooks::init().unwrap();
    let mut decoder = Decoder::new(&books);

    let mut buffer = vec![0u8; 64];
    {
        let mut stream = BitWriter::new(&mut buffer);
        stream.put_tag_pair(Tag::Sample.value(), SampleType::Group.value());
        stream.put_tag_pair(UNKNOWN_TAG, 0);
    }

    let mut reader = BitReader::new(&buffer);
    match decoder.decode_sample(&mut reader) {
        Err(CodecError::BadTag { tag, .. }) => assert_eq!(tag, UNKNOWN_TAG),
        other => panic!("expected a bad tag error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_truncated_sample_reports_underflow() {
    let books = Codebooks::init().unwrap();
    let params = EncoderParams {
        transform_type: TransformType::Spatial,
        gop_length: 1,
        num_spatial: 2,
        quality: 5,
        ..EncoderParams::default()
    };
    let mut encoder = Encoder::new(&books, params).unwrap();

    let frame: Vec<i16> = (0..32 * 32).map(|index| (index % 200) as i16).collect();
    let channels = [ChannelInput { width: 32, height: 32, frames: vec![&frame] }];

    let mut buffer = vec![0u8; 1 << 16];
    let used;
    {
        let mut stream = BitWriter::new(&mut buffer);
        encoder.encode_group(&mut stream, &channels).unwrap();
        used = stream.byte_count();
    }

    // Cut the sample off in the middle of the coefficient data
    let mut decoder = Decoder::new(&books);
    let mut reader = BitReader::new(&buffer[..used / 2]);
    match decoder.decode_sample(&mut reader) {
        Err(_) => {}
        Ok(None) => {}
        Ok(Some(_)) => panic!("a truncated sample must not decode"),
    }
}

#[test]
fn test_skip_subband_resynchronizes_at_the_band_trailer() {
    let books = Codebooks::init().unwrap();

    // A coefficient stream the reader does not want to decode,
    // followed by the band trailer and the next band header
    let mut buffer = vec![0u8; 256];
    {
        let mut stream = BitWriter::new(&mut buffer);
        let band = vec![3i16; 64];
        cfhd::vlc::encode_band(&mut stream, &books, &band, 8, 8, 8);
        stream.pad_bits_tag();
        stream.put_tag_pair(Tag::BandTrailer.value(), 0);
        stream.put_tag_pair(Tag::BandNumber.value(), 2);
    }

    let mut reader = BitReader::new(&buffer);
    reader.skip_bits(24);
    Decoder::skip_subband(&mut reader).unwrap();

    let next = reader.get_tag_value();
    assert_eq!(next.tag, Tag::BandNumber.value());
    assert_eq!(next.value, 2);
}

#[test]
fn test_find_next_sample() {
    let mut buffer = vec![0u8; 32];
    {
        let mut stream = BitWriter::new(&mut buffer);
        stream.put_tag_pair_optional(Tag::FrameNumber.value(), 12);
        stream.put_tag_pair(Tag::Sample.value(), SampleType::SequenceHeader.value());
    }

    let mut reader = BitReader::new(&buffer);
    let sample_type = Decoder::find_next_sample(&mut reader).unwrap();
    assert_eq!(sample_type, SampleType::SequenceHeader);
}
