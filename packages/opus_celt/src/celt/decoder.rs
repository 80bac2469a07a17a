use crate::error::{Error, Result};
use crate::range::{Coder, RangeDecoder};

use super::bands;
use super::config::CeltConfig;
use super::constants::{MAX_LM, NUM_BANDS, SHORT_MDCT_SIZE};
use super::encoder::{MAX_FRAME_BYTES, MIN_FRAME_BYTES};
use super::energy::{BandEnergies, BandSpan, EnergyState};
use super::frame::{FrameSymbols, FrameWalk, PostFilterParams, code_frame};

/// Decoded CELT frame.
///
/// The spectrum is ready for the inverse MDCT. The remaining fields report
/// the frame header so the caller can drive the post-filter and the
/// time-domain synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Denormalized MDCT coefficients, one run of `120 << lm` bins per
    /// channel. All zero for a silence frame.
    pub spectrum: Vec<i32>,
    /// Quantized band log energies (Q10, mean removed).
    pub band_log_e: BandEnergies,
    pub final_range: u32,
    pub post_filter: Option<PostFilterParams>,
    pub silence: bool,
    pub transient: bool,
    /// One past the last band that received bits.
    pub coded_bands: usize,
}

/// CELT spectral decoder.
///
/// RFC 6716 Section 4.3
#[derive(Debug, Clone)]
pub struct CeltDecoder {
    config: CeltConfig,
    energy: EnergyState,
    rng: u32,
}

impl CeltDecoder {
    /// Creates a new CELT decoder.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidConfig`] if the band range is invalid
    pub fn new(config: CeltConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            energy: EnergyState::default(),
            rng: 0,
        })
    }

    /// Resets decoder state
    pub fn reset(&mut self) {
        self.energy = EnergyState::default();
        self.rng = 0;
    }

    #[must_use]
    pub const fn config(&self) -> &CeltConfig {
        &self.config
    }

    /// Final range of the last decoded frame.
    #[must_use]
    pub const fn final_range(&self) -> u32 {
        self.rng
    }

    /// Band energy history carried between frames.
    #[must_use]
    pub const fn energy(&self) -> &EnergyState {
        &self.energy
    }

    /// Decodes one frame of `120 << lm` bins per channel.
    ///
    /// RFC 6716 Section 4.3 (Table 56). The decoder state is left untouched
    /// when the frame is rejected, so the caller can conceal it instead.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidConfig`] if `lm` is above 3
    /// * [`Error::InvalidFrame`] if `data` is shorter than 2 or longer than
    ///   1275 bytes
    /// * [`Error::CorruptFrame`] if the walk read past the frame or the range
    ///   decoder flagged an error
    pub fn decode_frame(&mut self, data: &[u8], lm: u8) -> Result<DecodedFrame> {
        if lm > MAX_LM {
            return Err(Error::InvalidConfig(format!(
                "LM {lm} outside 0..={MAX_LM}"
            )));
        }
        if !(MIN_FRAME_BYTES..=MAX_FRAME_BYTES).contains(&data.len()) {
            return Err(Error::InvalidFrame(format!(
                "frame of {} bytes outside {MIN_FRAME_BYTES}..={MAX_FRAME_BYTES}",
                data.len()
            )));
        }

        let channels = self.config.channel_count();
        let size = SHORT_MDCT_SIZE << lm;
        let span = BandSpan {
            start: self.config.start_band,
            end: self.config.end_band,
            lm,
            channels,
        };

        let mut energy = self.energy.clone();
        if channels == 1 {
            energy.fold_to_mono();
        }

        let symbols = FrameSymbols::default();
        let unused = [[0; NUM_BANDS]; 2];
        let walk = FrameWalk {
            span,
            symbols: &symbols,
            target: &unused,
            amplitudes: &unused,
            resynth: true,
        };

        let mut dec = RangeDecoder::new(data)?;
        let mut shapes = vec![0_i16; channels * size];
        let mut seed = self.rng;
        let outcome = code_frame(
            &mut Coder::Decoder(&mut dec),
            &mut energy,
            &walk,
            &mut shapes,
            &mut seed,
        );

        let tell = dec.ec_tell() as usize;
        if tell > 8 * data.len() {
            log::debug!("decode_frame: read {tell} bits from a {} byte frame", data.len());
            return Err(Error::CorruptFrame(format!(
                "read {tell} bits from a {} byte frame",
                data.len()
            )));
        }
        if dec.error() {
            log::debug!("decode_frame: range decoder error flag set");
            return Err(Error::CorruptFrame(
                "range decoder error flag set".to_string(),
            ));
        }

        let mut spectrum = vec![0; channels * size];
        if !outcome.silence {
            for (c, freq) in spectrum.chunks_exact_mut(size).enumerate() {
                bands::denormalise_bands(
                    &shapes[c * size..(c + 1) * size],
                    freq,
                    &energy.old_band_e[c],
                    span.start,
                    span.end,
                    lm,
                );
            }
        }
        let band_log_e = energy.old_band_e;

        energy.finish_frame(span, outcome.transient, true);
        self.energy = energy;
        self.rng = dec.range();

        log::trace!(
            "decode_frame: lm={lm} bytes={} silence={} transient={} intra={} spread={:?} \
             coded_bands={} anti_collapse={} final_range={:#010x}",
            data.len(),
            outcome.silence,
            outcome.transient,
            outcome.intra,
            outcome.spread,
            outcome.coded_bands,
            outcome.anti_collapse,
            self.rng
        );

        Ok(DecodedFrame {
            spectrum,
            band_log_e,
            final_range: self.rng,
            post_filter: outcome.post_filter,
            silence: outcome.silence,
            transient: outcome.transient,
            coded_bands: outcome.coded_bands,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::Channels;
    use crate::celt::energy::ENERGY_FLOOR;
    use crate::range::RangeEncoder;

    #[test_case(&[] ; "empty")]
    #[test_case(&[0x80] ; "one_byte")]
    fn test_decode_rejects_short_frames(data: &[u8]) {
        let mut decoder = CeltDecoder::new(CeltConfig::default()).unwrap();
        let result = decoder.decode_frame(data, 3);
        assert!(matches!(result, Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_decode_rejects_large_lm() {
        let mut decoder = CeltDecoder::new(CeltConfig::default()).unwrap();
        let result = decoder.decode_frame(&[0; 10], 4);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    /// A leading silence symbol followed by zero padding.
    fn silence_frame(bytes: usize) -> Vec<u8> {
        let mut enc = RangeEncoder::new(bytes).unwrap();
        enc.ec_enc_bit_logp(true, 15);
        enc.skip_to_end();
        enc.finish().unwrap()
    }

    #[test]
    fn test_decode_silence_flag() {
        let bytes = silence_frame(20);
        let mut decoder = CeltDecoder::new(CeltConfig::default()).unwrap();
        let frame = decoder.decode_frame(&bytes, 2).unwrap();

        assert!(frame.silence);
        assert_eq!(frame.post_filter, None);
        assert_eq!(frame.spectrum, vec![0; 480]);
        assert_eq!(frame.band_log_e[0], [ENERGY_FLOOR; NUM_BANDS]);
        assert_eq!(decoder.energy().old_band_e[1], [ENERGY_FLOOR; NUM_BANDS]);
    }

    #[test]
    fn test_decode_post_filter_parameters() {
        let mut enc = RangeEncoder::new(40).unwrap();
        enc.ec_enc_bit_logp(false, 15);
        enc.ec_enc_bit_logp(true, 1);
        enc.ec_enc_uint(2, 6);
        enc.ec_enc_bits(37, 6);
        enc.ec_enc_bits(3, 3);
        enc.ec_enc_icdf(1, &crate::celt::constants::TAPSET_ICDF, 2);
        let bytes = enc.finish().unwrap();

        let mut decoder = CeltDecoder::new(CeltConfig::default()).unwrap();
        let frame = decoder.decode_frame(&bytes, 3).unwrap();

        assert_eq!(
            frame.post_filter,
            Some(PostFilterParams {
                period: 64 + 37 - 1,
                gain_q15: 3072 * 4,
                tapset: 1,
            })
        );
    }

    #[test]
    fn test_decode_arbitrary_bytes_keeps_spectrum_size() {
        let config = CeltConfig::default().with_channels(Channels::Stereo);
        let mut decoder = CeltDecoder::new(config).unwrap();
        let data: Vec<u8> = (0..77_u32).map(|i| (i * 151 + 7) as u8).collect();

        for lm in 0..=3 {
            if let Ok(frame) = decoder.decode_frame(&data, lm) {
                assert_eq!(frame.spectrum.len(), 2 * (120 << lm));
                assert!(frame.coded_bands <= NUM_BANDS);
            }
        }
    }

    #[test]
    fn test_reset_clears_history() {
        let mut decoder = CeltDecoder::new(CeltConfig::default()).unwrap();
        decoder.decode_frame(&silence_frame(40), 3).unwrap();
        assert_ne!(decoder.final_range(), 0);

        decoder.reset();
        assert_eq!(decoder.final_range(), 0);
        assert_eq!(decoder.energy(), &EnergyState::default());
    }
}
