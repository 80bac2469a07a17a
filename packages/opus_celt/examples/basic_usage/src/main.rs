#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Basic CELT Spectral Coding Example
//!
//! Encodes a few frames of a synthetic spectrum at different frame sizes and
//! budgets, decodes them again and checks that both sides agree on the final
//! range of every frame.

use moosicbox_opus_celt::{
    CeltConfig, CeltDecoder, CeltEncoder, Channels, FrameParams, SHORT_MDCT_SIZE, SpectralFrame,
    band_range,
};

/// A decaying comb of partials, louder in the low bands.
fn synthetic_spectrum(lm: u8, channels: usize, frame: usize) -> Vec<i32> {
    let size = SHORT_MDCT_SIZE << lm;
    let mut coefficients = vec![0_i32; channels * size];
    for (c, run) in coefficients.chunks_exact_mut(size).enumerate() {
        for band in 0..18 {
            for bin in band_range(band, lm) {
                let phase = i32::try_from(bin * 37 + frame * 11 + c * 5).unwrap_or(0) % 64 - 32;
                let level = 60_000 / i32::try_from(band + 1).unwrap_or(1);
                run[bin] = phase * level / 32;
            }
        }
    }
    coefficients
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let config = CeltConfig::default().with_channels(Channels::Stereo);
    let channels = config.channel_count();
    let mut encoder = CeltEncoder::new(config.clone())?;
    let mut decoder = CeltDecoder::new(config)?;

    println!("Coding stereo frames at 48 kHz");
    for (frame, (lm, budget)) in [(3_u8, 160_usize), (3, 80), (2, 60), (1, 40), (0, 20)]
        .into_iter()
        .enumerate()
    {
        let params = FrameParams::default()
            .with_lm(lm)
            .with_transient(lm > 0 && frame == 1)
            .with_intensity(14);
        let spectrum = SpectralFrame::new(synthetic_spectrum(lm, channels, frame), channels)?;

        let encoded = encoder.encode_frame(&spectrum, &params, budget)?;
        let decoded = decoder.decode_frame(&encoded.bytes, lm)?;

        log::debug!("frame {frame}: {:?}", decoded.band_log_e[0]);
        println!(
            "  frame {frame}: {} ms, {budget} bytes, {} coded bands, transient={}, final range {:#010x} ({})",
            f64::from(2.5_f32) * f64::from(1_u8 << lm),
            decoded.coded_bands,
            decoded.transient,
            decoded.final_range,
            if decoded.final_range == encoded.final_range {
                "match"
            } else {
                "MISMATCH"
            }
        );
    }

    Ok(())
}
