#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

use moosicbox_opus_celt::{
    CeltConfig, CeltDecoder, CeltEncoder, Channels, Error, FrameParams, SpectralFrame,
};
use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
use test_case::test_case;

#[test]
fn test_invalid_band_range_is_rejected() {
    let config = CeltConfig::default().with_start_band(12).with_end_band(8);
    assert!(matches!(CeltEncoder::new(config.clone()), Err(Error::InvalidConfig(_))));
    assert!(matches!(CeltDecoder::new(config), Err(Error::InvalidConfig(_))));

    let config = CeltConfig::default().with_end_band(22);
    assert!(matches!(CeltDecoder::new(config), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_invalid_frame_params_are_rejected() {
    let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
    let frame = SpectralFrame::silent(&FrameParams::default(), 1);

    let result = encoder.encode_frame(&frame, &FrameParams::default().with_alloc_trim(11), 50);
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn test_rejected_frame_leaves_encoder_state_alone() {
    let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
    let params = FrameParams::default().with_lm(0);
    let frame = SpectralFrame::new(vec![100; 120], 1).unwrap();
    encoder.encode_frame(&frame, &params, 20).unwrap();
    let final_range = encoder.final_range();

    assert!(encoder.encode_frame(&frame, &params, 0).is_err());
    assert_eq!(encoder.final_range(), final_range);
}

#[test_case(1 ; "mono")]
#[test_case(2 ; "stereo")]
#[test_log::test]
fn test_random_bytes_decode_or_report_corruption(channels: usize) {
    let config = CeltConfig::default().with_channels(if channels == 2 {
        Channels::Stereo
    } else {
        Channels::Mono
    });
    let mut decoder = CeltDecoder::new(config).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..200 {
        let len = rng.random_range(2..=300);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let lm = rng.random_range(0..=3);
        let final_range = decoder.final_range();

        match decoder.decode_frame(&data, lm) {
            Ok(frame) => {
                assert_eq!(frame.spectrum.len(), channels * (120 << lm));
                assert_eq!(decoder.final_range(), frame.final_range);
            }
            Err(Error::CorruptFrame(_)) => assert_eq!(decoder.final_range(), final_range),
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
}

#[test]
fn test_decoding_with_another_frame_size_does_not_panic() {
    let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
    let mut decoder = CeltDecoder::new(CeltConfig::default()).unwrap();
    let params = FrameParams::default().with_lm(3);
    let coefficients = (0..960_i32).map(|i| (i * 37) % 200 - 100).collect();
    let frame = SpectralFrame::new(coefficients, 1).unwrap();

    let encoded = encoder.encode_frame(&frame, &params, 80).unwrap();
    for lm in 0..3 {
        let result = decoder.decode_frame(&encoded.bytes, lm);
        assert!(matches!(result, Ok(_) | Err(Error::CorruptFrame(_))));
    }
}
