//! Full sample round trips through the encoder and decoder for every
//! transform organisation.

use bitstream::{BitReader, BitWriter};
use cfhd::codebook::Codebooks;
use cfhd::{ChannelInput, Decoder, Encoder, EncoderParams, TransformType};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// A linear ramp: the highpass bands of a ramp are almost empty, so
// every coefficient stays within the codebook range
fn ramp_frame(width: usize, height: usize, offset: i16) -> Vec<i16> {
    (0..width * height)
        .map(|index| {
            let x = (index % width) as i16;
            let y = (index / width) as i16;
            ((x + y) << 2) + offset
        })
        .collect()
}

// A shallow ramp for the deep temporal pyramids: the fieldplus apex
// amplifies the lowpass by two orders of magnitude, so the input must
// stay within eight bits
fn shallow_ramp(width: usize, height: usize, offset: i16) -> Vec<i16> {
    (0..width * height)
        .map(|index| {
            let x = (index % width) as i16;
            let y = (index / width) as i16;
            x + y + offset
        })
        .collect()
}

// A ramp with small deterministic noise
fn noisy_frame(width: usize, height: usize, seed: u32) -> Vec<i16> {
    let mut state = seed;
    (0..width * height)
        .map(|index| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let noise = ((state >> 24) & 0x0F) as i16 - 8;
            let x = (index % width) as i16;
            let y = (index / width) as i16;
            (x + y) + noise
        })
        .collect()
}

fn encode_decode(
    params: EncoderParams,
    channels: &[ChannelInput],
) -> cfhd::decoder::DecodedGroup {
    init_logging();
    let books = Codebooks::init().unwrap();
    let mut encoder = Encoder::new(&books, params).unwrap();

    let mut buffer = vec![0u8; 1 << 20];
    let used;
    {
        let mut stream = BitWriter::new(&mut buffer);
        encoder
            .encode_sequence_header(&mut stream, channels[0].width, channels[0].height)
            .unwrap();
        encoder.encode_group(&mut stream, channels).unwrap();
        used = stream.byte_count();
    }

    let mut decoder = Decoder::new(&books);
    let mut reader = BitReader::new(&buffer[..used]);
    decoder
        .decode_sample(&mut reader)
        .unwrap()
        .expect("the stream contains one group")
}

#[test]
fn test_spatial_identity_one_level() {
    // Gradient image, one spatial level, every quantizer one: the
    // reconstruction is bit exact
    let frame = ramp_frame(64, 64, 0);
    let params = EncoderParams {
        transform_type: TransformType::Spatial,
        gop_length: 1,
        num_spatial: 1,
        quality: 5,
        ..EncoderParams::default()
    };
    let channels = [ChannelInput { width: 64, height: 64, frames: vec![&frame] }];

    let group = encode_decode(params, &channels);
    assert_eq!(group.channels.len(), 1);
    assert_eq!(group.channels[0].frames[0], frame);
}

#[test]
fn test_spatial_identity_two_levels_with_noise() {
    let frame = noisy_frame(48, 48, 0x5EED_0001);
    let params = EncoderParams {
        transform_type: TransformType::Spatial,
        gop_length: 1,
        num_spatial: 2,
        quality: 5,
        ..EncoderParams::default()
    };
    let channels = [ChannelInput { width: 48, height: 48, frames: vec![&frame] }];

    let group = encode_decode(params, &channels);
    assert_eq!(group.channels[0].frames[0], frame);
}

#[test]
fn test_fieldplus_round_trip_is_exact_at_unit_quantization() {
    // Two smooth frames differing by a constant: the temporal highpass
    // is small, the spatial highpass bands are almost empty
    let frame0 = shallow_ramp(64, 64, 0);
    let frame1 = shallow_ramp(64, 64, 12);
    let params = EncoderParams {
        transform_type: TransformType::FieldPlus,
        gop_length: 2,
        num_spatial: 3,
        quality: 5,
        ..EncoderParams::default()
    };
    let channels = [ChannelInput { width: 64, height: 64, frames: vec![&frame0, &frame1] }];

    let group = encode_decode(params, &channels);
    assert_eq!(group.num_frames, 2);
    assert_eq!(group.channels[0].frames[0], frame0);
    assert_eq!(group.channels[0].frames[1], frame1);
}

#[test]
fn test_field_round_trip() {
    let frame0 = shallow_ramp(64, 64, 0);
    let frame1 = shallow_ramp(64, 64, 12);
    let params = EncoderParams {
        transform_type: TransformType::Field,
        gop_length: 2,
        num_spatial: 2,
        quality: 5,
        ..EncoderParams::default()
    };
    let channels = [ChannelInput { width: 64, height: 64, frames: vec![&frame0, &frame1] }];

    let group = encode_decode(params, &channels);
    assert_eq!(group.channels[0].frames[0], frame0);
    assert_eq!(group.channels[0].frames[1], frame1);
}

#[test]
fn test_frame_transform_round_trip() {
    let frame0 = shallow_ramp(64, 64, 0);
    let frame1 = shallow_ramp(64, 64, 12);
    let params = EncoderParams {
        transform_type: TransformType::Frame,
        gop_length: 2,
        num_spatial: 2,
        quality: 5,
        ..EncoderParams::default()
    };
    let channels = [ChannelInput { width: 64, height: 64, frames: vec![&frame0, &frame1] }];

    let group = encode_decode(params, &channels);
    assert_eq!(group.channels[0].frames[0], frame0);
    assert_eq!(group.channels[0].frames[1], frame1);
}

#[test]
fn test_interlaced_round_trip() {
    let frame = shallow_ramp(64, 64, 0);
    let params = EncoderParams {
        transform_type: TransformType::Interlaced,
        gop_length: 1,
        num_spatial: 2,
        quality: 5,
        ..EncoderParams::default()
    };
    let channels = [ChannelInput { width: 64, height: 64, frames: vec![&frame] }];

    let group = encode_decode(params, &channels);
    assert_eq!(group.channels[0].frames[0], frame);
}

#[test]
fn test_three_channel_group() {
    let luma = ramp_frame(32, 32, 0);
    let cb = ramp_frame(32, 32, 16);
    let cr = ramp_frame(32, 32, 32);
    let params = EncoderParams {
        transform_type: TransformType::Spatial,
        gop_length: 1,
        num_spatial: 2,
        quality: 5,
        ..EncoderParams::default()
    };
    let channels = [
        ChannelInput { width: 32, height: 32, frames: vec![&luma] },
        ChannelInput { width: 32, height: 32, frames: vec![&cb] },
        ChannelInput { width: 32, height: 32, frames: vec![&cr] },
    ];

    let group = encode_decode(params, &channels);
    assert_eq!(group.channels.len(), 3);
    assert_eq!(group.channels[0].frames[0], luma);
    assert_eq!(group.channels[1].frames[0], cb);
    assert_eq!(group.channels[2].frames[0], cr);
}

#[test]
fn test_lossy_reconstruction_error_is_bounded() {
    let frame = noisy_frame(64, 64, 0xBEEF_0042);
    let params = EncoderParams {
        transform_type: TransformType::Spatial,
        gop_length: 1,
        num_spatial: 2,
        quality: 1,
        ..EncoderParams::default()
    };
    let channels = [ChannelInput { width: 64, height: 64, frames: vec![&frame] }];

    let group = encode_decode(params, &channels);
    let decoded = &group.channels[0].frames[0];

    let mut max_error = 0i32;
    let mut total_error = 0i64;
    for (&restored, &original) in decoded.iter().zip(frame.iter()) {
        let error = (restored as i32 - original as i32).abs();
        max_error = max_error.max(error);
        total_error += error as i64;
    }

    assert!(max_error <= 64, "max reconstruction error {}", max_error);
    assert!(total_error / (frame.len() as i64) <= 16);
}

#[test]
fn test_decoder_state_reflects_group_header() {
    init_logging();
    let books = Codebooks::init().unwrap();
    let params = EncoderParams {
        transform_type: TransformType::FieldPlus,
        gop_length: 2,
        num_spatial: 3,
        quality: 2,
        frame_number: 17,
        ..EncoderParams::default()
    };
    let mut encoder = Encoder::new(&books, params).unwrap();

    let frame0 = shallow_ramp(64, 64, 0);
    let frame1 = shallow_ramp(64, 64, 8);
    let channels = [ChannelInput { width: 64, height: 64, frames: vec![&frame0, &frame1] }];

    let mut buffer = vec![0u8; 1 << 20];
    let used;
    {
        let mut stream = BitWriter::new(&mut buffer);
        encoder.encode_group(&mut stream, &channels).unwrap();
        used = stream.byte_count();
    }

    let mut decoder = Decoder::new(&books);
    let mut reader = BitReader::new(&buffer[..used]);
    let group = decoder.decode_sample(&mut reader).unwrap().unwrap();
    assert_eq!(group.width, 64);
    assert_eq!(group.height, 64);

    let state = decoder.state();
    assert_eq!(state.transform_type, TransformType::FieldPlus);
    assert_eq!(state.num_frames, 2);
    assert_eq!(state.num_channels, 1);
    assert_eq!(state.num_wavelets, 6);
    assert_eq!(state.num_subbands, 17);
    assert_eq!(state.num_spatial, 3);
    assert_eq!(state.frame_number, 17);
    assert_eq!(state.quality & 0xFFFF, 2);
}

#[test]
fn test_empty_stream_decodes_to_none() {
    init_logging();
    let books = Codebooks::init().unwrap();
    let mut decoder = Decoder::new(&books);

    let buffer: [u8; 0] = [];
    let mut reader = BitReader::new(&buffer);
    assert!(decoder.decode_sample(&mut reader).unwrap().is_none());
}

#[test]
fn test_sequence_trailer_ends_the_stream() {
    init_logging();
    let books = Codebooks::init().unwrap();
    let params = EncoderParams {
        transform_type: TransformType::Spatial,
        gop_length: 1,
        num_spatial: 2,
        quality: 5,
        ..EncoderParams::default()
    };
    let encoder = Encoder::new(&books, params).unwrap();

    let mut buffer = vec![0u8; 256];
    let used;
    {
        let mut stream = BitWriter::new(&mut buffer);
        encoder.encode_sequence_trailer(&mut stream).unwrap();
        used = stream.byte_count();
    }

    let mut decoder = Decoder::new(&books);
    let mut reader = BitReader::new(&buffer[..used]);
    assert!(decoder.decode_sample(&mut reader).unwrap().is_none());
}
