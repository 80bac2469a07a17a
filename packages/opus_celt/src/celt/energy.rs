//! Band energy coding (RFC 6716 Section 4.3.2).
//!
//! Energies are base-2 logarithms of the band amplitudes in Q10 with the
//! per-band mean removed. They are coded in three stages: a coarse 6 dB
//! resolution with time and frequency prediction, fine refinement bits from
//! the allocator, and one last bit per band from whatever the frame has left.
//!
//! Reference: <https://gitlab.xiph.org/xiph/opus/-/blob/34bba701ae97c913de719b1f7c10686f62cddb15/celt/quant_bands.c>

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::range::Coder;

use super::constants::{
    BETA_COEF, BETA_INTRA, E_MEANS, E_PROB_MODEL, NUM_BANDS, PRED_COEF, SMALL_ENERGY_ICDF,
};
use super::math::{DB_SHIFT, celt_log2, mult16_16, pshr32};
use super::rate::MAX_FINE_BITS;

/// Floor of every coded log energy, -28 in Q10.
pub const ENERGY_FLOOR: i32 = -28 << DB_SHIFT;

/// Per-band energy arrays for up to two channels.
pub type BandEnergies = [[i32; NUM_BANDS]; 2];

/// Band energy history carried from frame to frame.
///
/// Both channels are always tracked; a mono stream mirrors its channel into
/// the second slot so that switching channel count keeps a sane history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergyState {
    /// Quantized log energy of the last frame, used for prediction.
    pub old_band_e: BandEnergies,
    /// Energy one frame back, kept across transients for anti-collapse.
    pub old_log_e: BandEnergies,
    /// Energy two frames back.
    pub old_log_e2: BandEnergies,
    /// Slowly rising floor of recent energies (decoder only).
    pub background_log_e: BandEnergies,
}

impl Default for EnergyState {
    fn default() -> Self {
        Self {
            old_band_e: [[0; NUM_BANDS]; 2],
            old_log_e: [[ENERGY_FLOOR; NUM_BANDS]; 2],
            old_log_e2: [[ENERGY_FLOOR; NUM_BANDS]; 2],
            background_log_e: [[0; NUM_BANDS]; 2],
        }
    }
}

/// Range of bands and channels an energy pass walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandSpan {
    pub start: usize,
    pub end: usize,
    pub lm: u8,
    pub channels: usize,
}

/// Log2 of a linear band amplitude with the band mean removed, Q10.
#[must_use]
pub const fn amp2log2(band_e: i32, band: usize) -> i32 {
    celt_log2(band_e << 2) - ((E_MEANS[band] as i32) << 6)
}

impl EnergyState {
    /// Codes the coarse energies of `span` and updates [`Self::old_band_e`]
    /// with the quantized values.
    ///
    /// Each band is predicted from the same band in the previous frame
    /// (unless `intra`) and from the band below in this frame; the residual
    /// is coded with a Laplace model while at least 15 bits remain in
    /// `budget`, then with cheaper fallbacks.
    ///
    /// # Arguments
    ///
    /// * `target` - Encoder only: log energies to quantize
    /// * `budget` - Frame size in whole bits
    /// * `max_decay` - Encoder only: largest drop from the previous frame that
    ///   is left to the prediction, Q10
    ///
    /// # Returns
    ///
    /// The quantization error per band, Q10 (always zero on the decoder).
    pub fn code_coarse(
        &mut self,
        coder: &mut Coder<'_>,
        target: &BandEnergies,
        span: BandSpan,
        intra: bool,
        budget: i32,
        max_decay: i32,
    ) -> BandEnergies {
        let encode = coder.is_encoder();
        let lm = usize::from(span.lm);
        let (coef, beta) = if intra {
            (0, BETA_INTRA)
        } else {
            (PRED_COEF[lm], BETA_COEF[lm])
        };
        let prob_model = &E_PROB_MODEL[lm][usize::from(intra)];

        let mut error = [[0; NUM_BANDS]; 2];
        // Frequency prediction state, Q17
        let mut prev = [0_i32; 2];

        for i in span.start..span.end {
            for c in 0..span.channels {
                let old = self.old_band_e[c][i];
                let old_e = old.max(-9 << DB_SHIFT);
                let prediction = pshr32(mult16_16(coef, old_e), 8) + prev[c];

                let mut qi = 0;
                let mut f = 0;
                if encode {
                    let x = target[c][i];
                    f = (x << 7) - prediction;
                    qi = (f + (1 << (DB_SHIFT + 6))) >> (DB_SHIFT + 7);

                    // Do not let the energy fall faster than the decay allows
                    let decay_bound = (old - max_decay).max(ENERGY_FLOOR);
                    if qi < 0 && x < decay_bound {
                        qi = (qi + ((decay_bound - x) >> DB_SHIFT)).min(0);
                    }

                    // Leave room for the remaining bands at one bit or so each
                    let bits_left =
                        budget - coder.tell() - 3 * (span.channels * (span.end - i)) as i32;
                    if i != span.start && bits_left < 30 {
                        if bits_left < 24 {
                            qi = qi.min(1);
                        }
                        if bits_left < 16 {
                            qi = qi.max(-1);
                        }
                    }
                }

                let remaining = budget - coder.tell();
                qi = if remaining >= 15 {
                    let pi = 2 * i.min(20);
                    coder.code_laplace(
                        qi,
                        u32::from(prob_model[pi]) << 7,
                        u32::from(prob_model[pi + 1]) << 6,
                    )
                } else if remaining >= 2 {
                    let qi = qi.clamp(-1, 1);
                    let symbol = (2 * qi) ^ -i32::from(qi < 0);
                    let symbol = coder.code_icdf(symbol as usize, &SMALL_ENERGY_ICDF, 2) as i32;
                    (symbol >> 1) ^ -(symbol & 1)
                } else if remaining >= 1 {
                    -i32::from(coder.code_bit_logp(qi.min(0) != 0, 1))
                } else {
                    -1
                };

                let q = qi << DB_SHIFT;
                if encode {
                    error[c][i] = pshr32(f, 7) - q;
                }
                let tmp = (prediction + (q << 7)).max(ENERGY_FLOOR << 7);
                self.old_band_e[c][i] = pshr32(tmp, 7);
                prev[c] += (q << 7) - mult16_16(beta, pshr32(q, 8));
            }
        }

        log::trace!("code_coarse: intra={intra} tell={}", coder.tell());

        error
    }

    /// Codes `fine_quant[i]` raw bits of refinement per band and channel.
    pub fn code_fine(
        &mut self,
        coder: &mut Coder<'_>,
        error: &mut BandEnergies,
        fine_quant: &[i32; NUM_BANDS],
        span: BandSpan,
    ) {
        for i in span.start..span.end {
            let bits = fine_quant[i];
            if bits <= 0 {
                continue;
            }
            let levels = 1 << bits;
            for c in 0..span.channels {
                let q2 = ((error[c][i] + (1 << (DB_SHIFT - 1))) >> (DB_SHIFT - bits))
                    .clamp(0, levels - 1);
                let q2 = coder.code_bits(q2 as u32, bits as u32) as i32;

                let offset =
                    (((q2 << DB_SHIFT) + (1 << (DB_SHIFT - 1))) >> bits) - (1 << (DB_SHIFT - 1));
                self.old_band_e[c][i] += offset;
                error[c][i] -= offset;
            }
        }
    }

    /// Spends the `bits_left` bits remaining at the end of the frame on one
    /// more refinement bit per band and channel, priority 0 bands first.
    pub fn code_finalise(
        &mut self,
        coder: &mut Coder<'_>,
        error: &mut BandEnergies,
        fine_quant: &[i32; NUM_BANDS],
        fine_priority: &[bool; NUM_BANDS],
        bits_left: i32,
        span: BandSpan,
    ) {
        let channels = span.channels as i32;
        let mut bits_left = bits_left;

        for prio in [false, true] {
            for i in span.start..span.end {
                if bits_left < channels {
                    break;
                }
                if fine_quant[i] >= MAX_FINE_BITS || fine_priority[i] != prio {
                    continue;
                }
                for c in 0..span.channels {
                    let q2 = coder.code_bits(u32::from(error[c][i] >= 0), 1) as i32;
                    let offset = ((q2 << DB_SHIFT) - (1 << (DB_SHIFT - 1))) >> (fine_quant[i] + 1);
                    self.old_band_e[c][i] += offset;
                    error[c][i] -= offset;
                    bits_left -= 1;
                }
            }
        }
    }

    /// Mono streams keep the louder of both histories in the first slot
    /// before a frame is decoded.
    pub(crate) fn fold_to_mono(&mut self) {
        for i in 0..NUM_BANDS {
            self.old_band_e[0][i] = self.old_band_e[0][i].max(self.old_band_e[1][i]);
        }
    }

    /// Marks every band as silent.
    pub(crate) fn silence(&mut self, channels: usize) {
        for band_e in &mut self.old_band_e[..channels] {
            band_e.fill(ENERGY_FLOOR);
        }
    }

    /// Rolls the history forward once a frame has been coded.
    ///
    /// Transient frames only pull the one-frame-back energy down so that
    /// anti-collapse keeps a view of the energy before the attack. Bands
    /// outside `start..end` are reset.
    pub(crate) fn finish_frame(
        &mut self,
        span: BandSpan,
        transient: bool,
        track_background: bool,
    ) {
        if span.channels == 1 {
            self.old_band_e[1] = self.old_band_e[0];
        }

        if transient {
            for (log_e, band_e) in self.old_log_e.iter_mut().zip(&self.old_band_e) {
                for (l, &b) in log_e.iter_mut().zip(band_e) {
                    *l = (*l).min(b);
                }
            }
        } else {
            self.old_log_e2 = self.old_log_e;
            self.old_log_e = self.old_band_e;
            if track_background {
                // 0.001 per 2.5 ms
                let rise = 1 << span.lm;
                for (bg, band_e) in self.background_log_e.iter_mut().zip(&self.old_band_e) {
                    for (g, &b) in bg.iter_mut().zip(band_e) {
                        *g = (*g + rise).min(b);
                    }
                }
            }
        }

        for c in 0..2 {
            for i in (0..span.start).chain(span.end..NUM_BANDS) {
                self.old_band_e[c][i] = 0;
                self.old_log_e[c][i] = ENERGY_FLOOR;
                self.old_log_e2[c][i] = ENERGY_FLOOR;
            }
        }
    }
}
