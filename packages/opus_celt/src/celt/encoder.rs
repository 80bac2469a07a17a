use crate::error::{Error, Result};
use crate::range::{Coder, RangeEncoder};

use super::bands;
use super::config::{CeltConfig, FrameParams};
use super::constants::{NUM_BANDS, SHORT_MDCT_SIZE};
use super::energy::{BandSpan, EnergyState, amp2log2};
use super::frame::{FrameSymbols, FrameWalk, code_frame};
use super::math::DB_SHIFT;

/// Smallest frame the walk can code.
pub const MIN_FRAME_BYTES: usize = 2;
/// Largest CELT frame.
pub const MAX_FRAME_BYTES: usize = 1275;

/// MDCT coefficients of one frame, one run of `120 << lm` bins per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectralFrame {
    coefficients: Vec<i32>,
    channels: usize,
}

impl SpectralFrame {
    /// # Errors
    ///
    /// * [`Error::InvalidFrame`] if `channels` is not 1 or 2, or the
    ///   coefficients do not split evenly between them
    pub fn new(coefficients: Vec<i32>, channels: usize) -> Result<Self> {
        if !(1..=2).contains(&channels) {
            return Err(Error::InvalidFrame(format!(
                "unsupported channel count {channels}"
            )));
        }
        if coefficients.is_empty() || coefficients.len() % channels != 0 {
            return Err(Error::InvalidFrame(format!(
                "{} coefficients do not split into {channels} channels",
                coefficients.len()
            )));
        }
        Ok(Self {
            coefficients,
            channels,
        })
    }

    /// An all-zero frame sized for `params.lm`.
    #[must_use]
    pub fn silent(params: &FrameParams, channels: usize) -> Self {
        let channels = channels.clamp(1, 2);
        Self {
            coefficients: vec![0; channels * (SHORT_MDCT_SIZE << params.lm)],
            channels,
        }
    }

    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Bins per channel.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.coefficients.len() / self.channels
    }

    #[must_use]
    pub fn coefficients(&self) -> &[i32] {
        &self.coefficients
    }

    #[must_use]
    pub fn channel(&self, channel: usize) -> &[i32] {
        let size = self.frame_size();
        &self.coefficients[channel * size..(channel + 1) * size]
    }
}

/// A coded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Exactly the requested number of bytes.
    pub bytes: Vec<u8>,
    /// Range coder state after the last symbol, which a decoder of the same
    /// frame must reproduce.
    pub final_range: u32,
    /// Quantized spectrum as a decoder will rebuild it, when the encoder was
    /// configured with resynthesis.
    pub resynthesized: Option<Vec<i32>>,
}

/// CELT spectral encoder.
///
/// Takes MDCT coefficients plus the analysis decisions in [`FrameParams`]
/// and produces constant-size frames.
#[derive(Debug, Clone)]
pub struct CeltEncoder {
    config: CeltConfig,
    energy: EnergyState,
    rng: u32,
    consec_transient: u32,
    last_coded_bands: usize,
}

impl CeltEncoder {
    /// Creates a new CELT encoder.
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
            consec_transient: 0,
            last_coded_bands: 0,
        })
    }

    /// Forgets all inter-frame history.
    pub fn reset(&mut self) {
        self.energy = EnergyState::default();
        self.rng = 0;
        self.consec_transient = 0;
        self.last_coded_bands = 0;
    }

    #[must_use]
    pub const fn config(&self) -> &CeltConfig {
        &self.config
    }

    /// Final range of the last encoded frame.
    #[must_use]
    pub const fn final_range(&self) -> u32 {
        self.rng
    }

    /// Encodes one frame into exactly `budget` bytes.
    ///
    /// The encoder state is only updated when the frame was coded
    /// successfully.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidConfig`] if `params` is out of range
    /// * [`Error::InvalidFrame`] if the spectrum does not match the channel
    ///   count and `params.lm`, or `budget` is outside 2..=1275
    /// * [`Error::BufferOverflow`] if the symbols did not fit in `budget`
    pub fn encode_frame(
        &mut self,
        frame: &SpectralFrame,
        params: &FrameParams,
        budget: usize,
    ) -> Result<EncodedFrame> {
        params.validate()?;
        let channels = self.config.channel_count();
        let lm = params.lm;
        let size = SHORT_MDCT_SIZE << lm;

        if frame.channels() != channels {
            return Err(Error::InvalidFrame(format!(
                "expected {channels} channels, got {}",
                frame.channels()
            )));
        }
        if frame.frame_size() != size {
            return Err(Error::InvalidFrame(format!(
                "expected {size} bins per channel for LM {lm}, got {}",
                frame.frame_size()
            )));
        }
        if !(MIN_FRAME_BYTES..=MAX_FRAME_BYTES).contains(&budget) {
            return Err(Error::InvalidFrame(format!(
                "frame budget {budget} outside {MIN_FRAME_BYTES}..={MAX_FRAME_BYTES} bytes"
            )));
        }

        let CeltConfig {
            start_band: start,
            end_band: end,
            resynthesis,
            ..
        } = self.config;
        let span = BandSpan {
            start,
            end,
            lm,
            channels,
        };

        let mut amplitudes = [[0; NUM_BANDS]; 2];
        let mut target = [[0; NUM_BANDS]; 2];
        let mut shapes = vec![0_i16; channels * size];
        for (c, shape) in shapes.chunks_exact_mut(size).enumerate() {
            let freq = frame.channel(c);
            amplitudes[c] = bands::compute_band_energies(freq, lm, end);
            for (i, log_e) in target[c].iter_mut().enumerate().take(end) {
                *log_e = amp2log2(amplitudes[c][i], i);
            }
            bands::normalise_bands(freq, shape, &amplitudes[c], lm, end);
        }

        let mut max_decay = 16 << DB_SHIFT;
        if end - start > 10 {
            let bytes = i32::try_from(budget).unwrap_or(i32::MAX);
            max_decay = max_decay.min(bytes << (DB_SHIFT - 3));
        }

        let symbols = FrameSymbols {
            silence: params.silence || frame.coefficients().iter().all(|&v| v == 0),
            transient: params.transient,
            intra: params.intra,
            spread: params.spread,
            alloc_trim: params.alloc_trim,
            boosts: std::array::from_fn(|i| params.boost(i)),
            tf_change: std::array::from_fn(|i| params.tf_change(i)),
            tf_select: params.tf_select,
            intensity: params.intensity,
            dual_stereo: params.dual_stereo,
            signal_bandwidth: params.signal_bandwidth.unwrap_or(end - 1).min(end - 1),
            prev_coded_bands: self.last_coded_bands,
            anti_collapse: params.anti_collapse.unwrap_or(self.consec_transient < 2),
            max_decay,
        };
        let walk = FrameWalk {
            span,
            symbols: &symbols,
            target: &target,
            amplitudes: &amplitudes,
            resynth: resynthesis,
        };

        let mut energy = self.energy.clone();
        let mut seed = self.rng;
        let mut enc = RangeEncoder::new(budget)?;
        let outcome = code_frame(
            &mut Coder::Encoder(&mut enc),
            &mut energy,
            &walk,
            &mut shapes,
            &mut seed,
        );

        let final_range = enc.range();
        let bytes = enc.finish().inspect_err(|e| {
            log::debug!("encode_frame: rejected: {e}");
        })?;

        let resynthesized = resynthesis.then(|| {
            let mut spectrum = vec![0; channels * size];
            if !outcome.silence {
                for (c, freq) in spectrum.chunks_exact_mut(size).enumerate() {
                    bands::denormalise_bands(
                        &shapes[c * size..(c + 1) * size],
                        freq,
                        &energy.old_band_e[c],
                        start,
                        end,
                        lm,
                    );
                }
            }
            spectrum
        });

        energy.finish_frame(span, outcome.transient, false);
        self.energy = energy;
        self.rng = final_range;
        if outcome.transient {
            self.consec_transient += 1;
        } else {
            self.consec_transient = 0;
        }
        self.last_coded_bands = if self.last_coded_bands == 0 {
            outcome.coded_bands
        } else {
            outcome
                .coded_bands
                .max(self.last_coded_bands - 1)
                .min(self.last_coded_bands + 1)
        };

        log::trace!(
            "encode_frame: lm={lm} bytes={budget} coded_bands={} final_range={final_range:#010x}",
            outcome.coded_bands
        );

        Ok(EncodedFrame {
            bytes,
            final_range,
            resynthesized,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::Channels;

    fn tone(lm: u8, channels: usize) -> SpectralFrame {
        let size = SHORT_MDCT_SIZE << lm;
        let mut coefficients = vec![0; channels * size];
        for (c, run) in coefficients.chunks_exact_mut(size).enumerate() {
            for (j, v) in run.iter_mut().enumerate().take(100 << lm) {
                let bin = j as i32;
                *v = ((bin * 7919 + (c as i32) * 31) % 2001 - 1000) * (4000 / (bin + 8));
            }
        }
        SpectralFrame::new(coefficients, channels).unwrap()
    }

    #[test]
    fn test_spectral_frame_rejects_uneven_channels() {
        assert!(SpectralFrame::new(vec![0; 241], 2).is_err());
        assert!(SpectralFrame::new(vec![0; 240], 3).is_err());
        assert!(SpectralFrame::new(Vec::new(), 1).is_err());
        assert_eq!(SpectralFrame::new(vec![0; 240], 2).unwrap().frame_size(), 120);
    }

    #[test_case(1 ; "too_small")]
    #[test_case(1276 ; "too_large")]
    fn test_encode_rejects_budget(budget: usize) {
        let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
        let params = FrameParams::default().with_lm(0);
        let result = encoder.encode_frame(&SpectralFrame::silent(&params, 1), &params, budget);
        assert!(matches!(result, Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_encode_rejects_wrong_frame_size() {
        let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
        let frame = tone(2, 1);
        let result = encoder.encode_frame(&frame, &FrameParams::default().with_lm(3), 100);
        assert!(matches!(result, Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_encode_rejects_channel_mismatch() {
        let config = CeltConfig::default().with_channels(Channels::Stereo);
        let mut encoder = CeltEncoder::new(config).unwrap();
        let result = encoder.encode_frame(&tone(1, 1), &FrameParams::default().with_lm(1), 100);
        assert!(matches!(result, Err(Error::InvalidFrame(_))));
    }

    #[test_case(0, 1, 2 ; "lm0_minimal")]
    #[test_case(1, 1, 30 ; "lm1_mono")]
    #[test_case(3, 1, 160 ; "lm3_mono")]
    #[test_case(3, 2, 320 ; "lm3_stereo")]
    fn test_encoded_frame_has_requested_size(lm: u8, channels: usize, budget: usize) {
        let config = CeltConfig::default().with_channels(if channels == 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        });
        let mut encoder = CeltEncoder::new(config).unwrap();
        let params = FrameParams::default().with_lm(lm);
        let encoded = encoder.encode_frame(&tone(lm, channels), &params, budget).unwrap();

        assert_eq!(encoded.bytes.len(), budget);
        assert_eq!(encoder.final_range(), encoded.final_range);
        assert_eq!(encoded.resynthesized, None);
    }

    #[test]
    fn test_consecutive_transients_disable_anti_collapse() {
        let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
        let params = FrameParams::default().with_lm(3).with_transient(true);
        for expected in [0, 1, 2, 3] {
            assert_eq!(encoder.consec_transient, expected);
            encoder.encode_frame(&tone(3, 1), &params, 120).unwrap();
        }

        let steady = FrameParams::default().with_lm(3);
        encoder.encode_frame(&tone(3, 1), &steady, 120).unwrap();
        assert_eq!(encoder.consec_transient, 0);
    }

    #[test]
    fn test_coded_bands_hysteresis_moves_one_band_per_frame() {
        let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
        let params = FrameParams::default().with_lm(3);
        encoder.encode_frame(&tone(3, 1), &params, 200).unwrap();
        let wide = encoder.last_coded_bands;
        assert!(wide > 2);

        encoder.encode_frame(&tone(3, 1), &params, 8).unwrap();
        assert_eq!(encoder.last_coded_bands, wide - 1);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut encoder = CeltEncoder::new(CeltConfig::default()).unwrap();
        let params = FrameParams::default().with_lm(2);
        encoder.encode_frame(&tone(2, 1), &params, 60).unwrap();
        assert_ne!(encoder.final_range(), 0);

        encoder.reset();
        assert_eq!(encoder.final_range(), 0);
        assert_eq!(encoder.energy, EnergyState::default());
    }
}
