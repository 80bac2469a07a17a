#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

use moosicbox_opus_celt::{
    Bandwidth, CeltConfig, CeltDecoder, CeltEncoder, Channels, FrameParams, NUM_BANDS,
    SHORT_MDCT_SIZE, SpectralFrame, Spread, band_range,
};
use pretty_assertions::assert_eq;
use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
use test_case::test_case;

fn channels_of(count: usize) -> Channels {
    if count == 2 {
        Channels::Stereo
    } else {
        Channels::Mono
    }
}

/// Noise with a random level per band, loosely tilted towards the low bands.
fn random_frame(rng: &mut StdRng, lm: u8, channels: usize) -> SpectralFrame {
    let size = SHORT_MDCT_SIZE << lm;
    let mut coefficients = vec![0; channels * size];
    for run in coefficients.chunks_exact_mut(size) {
        for band in 0..NUM_BANDS {
            let shift = rng.random_range(4..18) - i32::try_from(band / 4).unwrap();
            let level = 1 << shift.max(2);
            for bin in band_range(band, lm) {
                run[bin] = rng.random_range(-level..=level);
            }
        }
    }
    SpectralFrame::new(coefficients, channels).unwrap()
}

/// Codes `frames` through an encoder with resynthesis and a decoder, checking
/// that both ends agree on every frame.
fn assert_stream_agrees(config: &CeltConfig, frames: &[(FrameParams, usize)], seed: u64) {
    let channels = config.channel_count();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut encoder = CeltEncoder::new(config.clone().with_resynthesis(true)).unwrap();
    let mut decoder = CeltDecoder::new(config.clone()).unwrap();

    for (index, (params, budget)) in frames.iter().enumerate() {
        let frame = random_frame(&mut rng, params.lm, channels);
        let encoded = encoder.encode_frame(&frame, params, *budget).unwrap();
        assert_eq!(encoded.bytes.len(), *budget, "frame {index}");

        let decoded = decoder.decode_frame(&encoded.bytes, params.lm).unwrap();
        assert_eq!(decoded.final_range, encoded.final_range, "frame {index}");
        assert_eq!(Some(decoded.spectrum), encoded.resynthesized, "frame {index}");
        assert_eq!(decoder.final_range(), encoder.final_range(), "frame {index}");
        assert!(decoded.post_filter.is_none(), "frame {index}");
    }
}

#[test_case(1, 0, 20 ; "mono_lm0")]
#[test_case(1, 1, 40 ; "mono_lm1")]
#[test_case(1, 2, 70 ; "mono_lm2")]
#[test_case(1, 3, 120 ; "mono_lm3")]
#[test_case(1, 3, 1275 ; "mono_lm3_max_budget")]
#[test_case(1, 3, 9 ; "mono_lm3_starved")]
#[test_case(2, 0, 30 ; "stereo_lm0")]
#[test_case(2, 1, 60 ; "stereo_lm1")]
#[test_case(2, 2, 100 ; "stereo_lm2")]
#[test_case(2, 3, 200 ; "stereo_lm3")]
#[test_case(2, 3, 16 ; "stereo_lm3_starved")]
#[test_log::test]
fn test_stream_round_trip(channels: usize, lm: u8, budget: usize) {
    let config = CeltConfig::default().with_channels(channels_of(channels));
    let frames: Vec<_> = (0..4)
        .map(|i| {
            let params = FrameParams::default().with_lm(lm).with_intra(i == 0);
            (params, budget)
        })
        .collect();

    assert_stream_agrees(&config, &frames, u64::from(lm) * 10 + channels as u64);
}

#[test_case(1 ; "mono")]
#[test_case(2 ; "stereo")]
#[test_log::test]
fn test_transient_frames_round_trip(channels: usize) {
    let config = CeltConfig::default().with_channels(channels_of(channels));
    let mut tf_change = vec![false; NUM_BANDS];
    for band in [0, 1, 5, 6, 12] {
        tf_change[band] = true;
    }

    let frames = vec![
        (FrameParams::default().with_lm(3), 160),
        (FrameParams::default().with_lm(3).with_transient(true), 160),
        (
            FrameParams::default()
                .with_lm(3)
                .with_transient(true)
                .with_tf_change(tf_change.clone(), true),
            140,
        ),
        (
            FrameParams::default()
                .with_lm(2)
                .with_transient(true)
                .with_tf_change(tf_change, false),
            90,
        ),
        (FrameParams::default().with_lm(1).with_transient(true), 50),
        (FrameParams::default().with_lm(3), 160),
    ];

    assert_stream_agrees(&config, &frames, 99);
}

#[test]
fn test_anti_collapse_override_round_trips() {
    let config = CeltConfig::default();
    let transient = FrameParams::default().with_lm(3).with_transient(true);
    let frames = vec![
        (transient.clone().with_anti_collapse(true), 40),
        (transient.clone().with_anti_collapse(false), 40),
        (transient.clone(), 40),
        (transient, 40),
    ];

    assert_stream_agrees(&config, &frames, 5);
}

#[test_case(Spread::None ; "none")]
#[test_case(Spread::Light ; "light")]
#[test_case(Spread::Aggressive ; "aggressive")]
fn test_spread_and_trim_round_trip(spread: Spread) {
    let config = CeltConfig::default();
    let frames: Vec<_> = [0, 3, 5, 8, 10]
        .into_iter()
        .map(|trim| {
            let params = FrameParams::default()
                .with_lm(2)
                .with_spread(spread)
                .with_alloc_trim(trim);
            (params, 64)
        })
        .collect();

    assert_stream_agrees(&config, &frames, 11);
}

#[test]
fn test_boosted_bands_round_trip() {
    let config = CeltConfig::default().with_channels(Channels::Stereo);
    let mut boosts = vec![0; NUM_BANDS];
    boosts[2] = 3;
    boosts[9] = 1;
    boosts[17] = 2;
    let params = FrameParams::default().with_lm(3).with_boosts(boosts);

    assert_stream_agrees(&config, &[(params.clone(), 180), (params, 90)], 21);
}

#[test_case(0, false ; "intensity_from_first_band")]
#[test_case(8, false ; "intensity_8")]
#[test_case(14, true ; "intensity_14_dual")]
#[test_case(NUM_BANDS, true ; "dual_only")]
fn test_stereo_modes_round_trip(intensity: usize, dual_stereo: bool) {
    let config = CeltConfig::default().with_channels(Channels::Stereo);
    let frames: Vec<_> = [3_u8, 2, 1, 0]
        .into_iter()
        .map(|lm| {
            let params = FrameParams::default()
                .with_lm(lm)
                .with_intensity(intensity)
                .with_dual_stereo(dual_stereo);
            (params, 24 << lm)
        })
        .collect();

    assert_stream_agrees(&config, &frames, 33);
}

#[test]
fn test_band_limited_streams_round_trip() {
    let narrow = CeltConfig::default().with_bandwidth(Bandwidth::Narrowband);
    let upper = CeltConfig::default()
        .with_channels(Channels::Stereo)
        .with_start_band(17);
    let params = FrameParams::default()
        .with_lm(3)
        .with_signal_bandwidth(10);

    assert_stream_agrees(&narrow, &[(params.clone(), 60), (params.clone(), 30)], 2);
    assert_stream_agrees(&upper, &[(params.clone(), 60), (params, 30)], 3);
}

#[test]
fn test_band_limited_stream_leaves_upper_bins_empty() {
    let config = CeltConfig::default().with_bandwidth(Bandwidth::Wideband);
    let mut encoder = CeltEncoder::new(config.clone()).unwrap();
    let mut decoder = CeltDecoder::new(config).unwrap();
    let params = FrameParams::default().with_lm(2);
    let mut rng = StdRng::seed_from_u64(8);

    let encoded = encoder
        .encode_frame(&random_frame(&mut rng, 2, 1), &params, 80)
        .unwrap();
    let decoded = decoder.decode_frame(&encoded.bytes, 2).unwrap();

    let first_unused = band_range(17, 2).start;
    assert!(decoded.spectrum[first_unused..].iter().all(|&v| v == 0));
    assert!(decoded.spectrum[..first_unused].iter().any(|&v| v != 0));
    assert!(decoded.coded_bands <= 17);
}

#[test_log::test]
fn test_silence_between_frames() {
    let config = CeltConfig::default();
    let mut encoder = CeltEncoder::new(config.clone()).unwrap();
    let mut decoder = CeltDecoder::new(config).unwrap();
    let params = FrameParams::default().with_lm(3);
    let mut rng = StdRng::seed_from_u64(4);

    let frames = [
        random_frame(&mut rng, 3, 1),
        SpectralFrame::silent(&params, 1),
        random_frame(&mut rng, 3, 1),
    ];
    for (index, frame) in frames.iter().enumerate() {
        let encoded = encoder.encode_frame(frame, &params, 100).unwrap();
        let decoded = decoder.decode_frame(&encoded.bytes, 3).unwrap();

        assert_eq!(decoded.silence, index == 1);
        assert_eq!(decoded.final_range, encoded.final_range);
        if decoded.silence {
            assert!(decoded.spectrum.iter().all(|&v| v == 0));
        }
    }
}

#[test]
fn test_forced_silence_ignores_the_spectrum() {
    let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
    let mut decoder = CeltDecoder::new(CeltConfig::default()).unwrap();
    let params = FrameParams::default().with_lm(1).with_silence(true);
    let mut rng = StdRng::seed_from_u64(6);

    let encoded = encoder
        .encode_frame(&random_frame(&mut rng, 1, 1), &params, 50)
        .unwrap();
    let decoded = decoder.decode_frame(&encoded.bytes, 1).unwrap();

    assert!(decoded.silence);
    assert_eq!(decoded.final_range, encoded.final_range);
}

#[test]
fn test_decoded_energy_follows_the_input_level() {
    let config = CeltConfig::default();
    let mut encoder = CeltEncoder::new(config.clone()).unwrap();
    let mut decoder = CeltDecoder::new(config).unwrap();
    let params = FrameParams::default().with_lm(3);

    let mut quiet = vec![0; 960];
    let mut loud = vec![0; 960];
    for bin in 0..800 {
        let sign = if bin % 3 == 0 { -1 } else { 1 };
        quiet[bin] = sign * 100;
        loud[bin] = sign * 100 * 64;
    }

    let mut band_energies = Vec::new();
    for coefficients in [quiet, loud] {
        for _ in 0..3 {
            let frame = SpectralFrame::new(coefficients.clone(), 1).unwrap();
            let encoded = encoder.encode_frame(&frame, &params, 120).unwrap();
            band_energies.push(decoder.decode_frame(&encoded.bytes, 3).unwrap().band_log_e[0]);
        }
    }

    // 64x the amplitude is 6 in log2, 6144 in Q10
    let (quiet, loud) = (band_energies[2], band_energies[5]);
    for band in 0..NUM_BANDS {
        let diff = loud[band] - quiet[band];
        assert!((5 * 1024..=7 * 1024).contains(&diff), "band {band}: {diff}");
    }
}
