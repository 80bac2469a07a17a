//! The frame symbol walk (RFC 6716 Section 4.3, Table 56).
//!
//! Encoder and decoder go through the same sequence of symbols and the same
//! budget checks, so the walk is written once over [`Coder`]. When encoding,
//! [`FrameSymbols`] holds the decisions to signal; when decoding it is
//! ignored and every decision comes out of the bitstream.
//!
//! Reference: <https://gitlab.xiph.org/xiph/opus/-/blob/34bba701ae97c913de719b1f7c10686f62cddb15/celt/celt_decoder.c>

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use crate::range::{BITRES, Coder};

use super::bands::{self, BandsRequest};
use super::config::Spread;
use super::constants::{
    NUM_BANDS, SPREAD_ICDF, TAPSET_ICDF, TF_SELECT_TABLE, TRIM_ICDF, band_width,
};
use super::energy::{BandEnergies, BandSpan, EnergyState};
use super::rate::{AllocationRequest, compute_allocation, init_caps};

/// Pitch post-filter parameters carried in the frame header.
///
/// They are reported as decoded; applying the comb filter belongs to the
/// time-domain synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostFilterParams {
    /// Pitch period in samples, 15..=1022.
    pub period: u16,
    /// Filter gain in Q15, a multiple of 3072.
    pub gain_q15: u16,
    /// Tap set index, 0..=2.
    pub tapset: u8,
}

/// Decisions the encoder signals in a frame.
#[derive(Debug, Clone)]
pub(crate) struct FrameSymbols {
    pub silence: bool,
    pub transient: bool,
    pub intra: bool,
    pub spread: Spread,
    pub alloc_trim: usize,
    /// Requested boost steps per band.
    pub boosts: [u32; NUM_BANDS],
    pub tf_change: [bool; NUM_BANDS],
    pub tf_select: bool,
    pub intensity: usize,
    pub dual_stereo: bool,
    pub signal_bandwidth: usize,
    pub prev_coded_bands: usize,
    pub anti_collapse: bool,
    /// Largest drop of a band energy the coarse quantizer tracks, Q10.
    pub max_decay: i32,
}

impl Default for FrameSymbols {
    fn default() -> Self {
        Self {
            silence: false,
            transient: false,
            intra: false,
            spread: Spread::Normal,
            alloc_trim: 5,
            boosts: [0; NUM_BANDS],
            tf_change: [false; NUM_BANDS],
            tf_select: false,
            intensity: 0,
            dual_stereo: false,
            signal_bandwidth: 0,
            prev_coded_bands: 0,
            anti_collapse: false,
            max_decay: 0,
        }
    }
}

/// Everything a frame walk needs besides the coder and the energy state.
pub(crate) struct FrameWalk<'a> {
    pub span: BandSpan,
    pub symbols: &'a FrameSymbols,
    /// Target log energies; only read when encoding.
    pub target: &'a BandEnergies,
    /// Linear band amplitudes; only read when encoding stereo.
    pub amplitudes: &'a BandEnergies,
    /// Reconstruct the quantized shapes in place (always on when decoding).
    pub resynth: bool,
}

/// What was actually coded in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FrameOutcome {
    pub silence: bool,
    pub post_filter: Option<PostFilterParams>,
    pub transient: bool,
    pub intra: bool,
    pub spread: Spread,
    pub coded_bands: usize,
    pub anti_collapse: bool,
}

/// Codes one frame.
///
/// `shapes` holds `span.channels` runs of `120 << lm` normalized bins. When
/// encoding they are the shapes to quantize; with `resynth` (and always when
/// decoding) they are replaced by the quantized shapes, anti-collapse
/// included. `seed` is the folding noise generator state, advanced in place.
///
/// On return `energy.old_band_e` holds the quantized energies of this frame;
/// rolling the history forward is left to the caller.
pub(crate) fn code_frame(
    coder: &mut Coder<'_>,
    energy: &mut EnergyState,
    walk: &FrameWalk<'_>,
    shapes: &mut [i16],
    seed: &mut u32,
) -> FrameOutcome {
    let FrameWalk {
        span,
        symbols,
        target,
        amplitudes,
        resynth,
    } = *walk;
    let resynth = resynth || !coder.is_encoder();
    let BandSpan {
        start,
        end,
        lm,
        channels,
    } = span;
    let frame_bytes = coder.storage() as i32;
    let total_bits = frame_bytes * 8;

    let mut tell = coder.tell();
    let silence = if tell >= total_bits {
        true
    } else if tell == 1 {
        coder.code_bit_logp(symbols.silence, 15)
    } else {
        false
    };
    if silence {
        coder.skip_to_end();
        tell = coder.tell();
    }

    let mut post_filter = None;
    if start == 0 && tell + 16 <= total_bits {
        // The encoder works on MDCT coefficients and has no pitch pre-filter,
        // so it always codes the flag as off. Decoded parameters are returned
        // for the caller's post-filter.
        if coder.code_bit_logp(false, 1) {
            let octave = coder.code_uint(0, 6);
            let period = (16 << octave) + coder.code_bits(0, 4 + octave) - 1;
            let qg = coder.code_bits(0, 3);
            let tapset = if coder.tell() + 2 <= total_bits {
                coder.code_icdf(0, &TAPSET_ICDF, 2)
            } else {
                0
            };
            post_filter = Some(PostFilterParams {
                period: period as u16,
                gain_q15: (3072 * (qg + 1)) as u16,
                tapset: tapset as u8,
            });
        }
        tell = coder.tell();
    }

    let transient = lm > 0 && tell + 3 <= total_bits && coder.code_bit_logp(symbols.transient, 3);
    let intra = coder.tell() + 3 <= total_bits && coder.code_bit_logp(symbols.intra, 3);

    let mut error = energy.code_coarse(coder, target, span, intra, total_bits, symbols.max_decay);

    let tf_res = code_tf(coder, span, transient, &symbols.tf_change, symbols.tf_select);

    let spread = if coder.tell() + 4 <= total_bits {
        Spread::from_symbol(coder.code_icdf(symbols.spread as usize, &SPREAD_ICDF, 5))
    } else {
        Spread::Normal
    };

    let caps = init_caps(lm, channels);
    let (offsets, remaining_frac) = code_boosts(coder, span, &caps, &symbols.boosts);

    let alloc_trim = if coder.tell_frac() + (6 << BITRES) <= remaining_frac {
        coder.code_icdf(symbols.alloc_trim, &TRIM_ICDF, 7)
    } else {
        5
    };

    let mut bits = (total_bits << BITRES) - coder.tell_frac() - 1;
    let anti_collapse_rsv = if transient && lm >= 2 && bits >= (i32::from(lm) + 2) << BITRES {
        1 << BITRES
    } else {
        0
    };
    bits -= anti_collapse_rsv;

    let allocation = compute_allocation(
        &AllocationRequest {
            start,
            end,
            lm,
            channels,
            offsets: &offsets,
            caps: &caps,
            alloc_trim: alloc_trim as i32,
            total: bits,
            intensity: symbols.intensity,
            dual_stereo: symbols.dual_stereo,
            prev_coded_bands: symbols.prev_coded_bands,
            signal_bandwidth: symbols.signal_bandwidth,
        },
        coder,
    );

    energy.code_fine(coder, &mut error, &allocation.fine_quant, span);

    let size = 120 << lm;
    let request = BandsRequest {
        start,
        end,
        lm,
        short_blocks: transient,
        spread,
        dual_stereo: allocation.dual_stereo,
        intensity: allocation.intensity,
        tf_res: &tf_res,
        pulses: &allocation.pulses,
        total_bits: (total_bits << BITRES) - anti_collapse_rsv,
        balance: allocation.balance,
        coded_bands: allocation.coded_bands,
        band_e: amplitudes,
        resynth,
    };
    let collapse_masks = if channels == 2 {
        let (x, y) = shapes.split_at_mut(size);
        bands::quant_all_bands(&request, x, Some(y), coder, seed)
    } else {
        bands::quant_all_bands(&request, &mut shapes[..size], None, coder, seed)
    };

    let anti_collapse =
        anti_collapse_rsv > 0 && coder.code_bits(u32::from(symbols.anti_collapse), 1) != 0;

    let bits_left = total_bits - coder.tell();
    energy.code_finalise(
        coder,
        &mut error,
        &allocation.fine_quant,
        &allocation.fine_priority,
        bits_left,
        span,
    );

    if anti_collapse && resynth {
        bands::anti_collapse(
            &mut shapes[..channels * size],
            channels,
            &collapse_masks,
            lm,
            start,
            end,
            energy,
            &allocation.pulses,
            *seed,
        );
    }

    if silence {
        energy.silence(channels);
    }

    log::trace!(
        "code_frame: silence={silence} transient={transient} intra={intra} spread={spread:?} \
         trim={alloc_trim} coded_bands={} anti_collapse={anti_collapse} tell={}",
        allocation.coded_bands,
        coder.tell()
    );

    FrameOutcome {
        silence,
        post_filter,
        transient,
        intra,
        spread,
        coded_bands: allocation.coded_bands,
        anti_collapse,
    }
}

/// Codes the per-band time-frequency resolution changes and `tf_select`,
/// returning the resulting `tf_res` per band.
///
/// A change is coded relative to the previous band. `tf_select` is only
/// coded when it would make a difference for this `LM` and transient flag.
fn code_tf(
    coder: &mut Coder<'_>,
    span: BandSpan,
    transient: bool,
    tf_change: &[bool; NUM_BANDS],
    tf_select: bool,
) -> [i32; NUM_BANDS] {
    let mut budget = (coder.storage() * 8) as i32;
    let mut tell = coder.tell();
    let mut logp = if transient { 2 } else { 4 };
    let select_rsv = span.lm > 0 && tell + logp + 1 <= budget;
    budget -= i32::from(select_rsv);

    let mut changes = [false; NUM_BANDS];
    let mut curr = false;
    let mut changed = false;
    for i in span.start..span.end {
        if tell + logp <= budget {
            curr ^= coder.code_bit_logp(tf_change[i] ^ curr, logp as u32);
            tell = coder.tell();
            changed |= curr;
        }
        changes[i] = curr;
        logp = if transient { 4 } else { 5 };
    }

    let row = &TF_SELECT_TABLE[usize::from(span.lm)];
    let base = 4 * usize::from(transient) + usize::from(changed);
    let tf_select = select_rsv && row[base] != row[base + 2] && coder.code_bit_logp(tf_select, 1);

    let mut tf_res = [0; NUM_BANDS];
    for i in span.start..span.end {
        let index = 4 * usize::from(transient) + 2 * usize::from(tf_select) + usize::from(changes[i]);
        tf_res[i] = i32::from(row[index]);
    }
    tf_res
}

/// Codes the dynamic allocation boosts, in quanta of at least 6 bits (or one
/// bit per bin for wide bands), never beyond a band's cap.
///
/// Returns the boost per band in 1/8 bits and the frame budget left after
/// them, also in 1/8 bits.
fn code_boosts(
    coder: &mut Coder<'_>,
    span: BandSpan,
    caps: &[i32; NUM_BANDS],
    requested: &[u32; NUM_BANDS],
) -> ([i32; NUM_BANDS], i32) {
    let mut offsets = [0; NUM_BANDS];
    let mut total_bits = ((coder.storage() * 8) as i32) << BITRES;
    let mut tell = coder.tell_frac();
    let mut logp = 6;

    for i in span.start..span.end {
        let width = (span.channels * band_width(i, span.lm)) as i32;
        let quanta = (width << BITRES).min((6 << BITRES).max(width));
        let mut loop_logp = logp;
        let mut boost = 0;
        let mut steps = requested[i];
        while tell + (loop_logp << BITRES) < total_bits && boost < caps[i] {
            let flag = coder.code_bit_logp(steps > 0, loop_logp as u32);
            tell = coder.tell_frac();
            if !flag {
                break;
            }
            steps = steps.saturating_sub(1);
            boost += quanta;
            total_bits -= quanta;
            loop_logp = 1;
        }
        offsets[i] = boost;
        if boost > 0 {
            logp = (logp - 1).max(2);
        }
    }

    (offsets, total_bits)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::range::{RangeDecoder, RangeEncoder};

    fn span(lm: u8) -> BandSpan {
        BandSpan {
            start: 0,
            end: NUM_BANDS,
            lm,
            channels: 1,
        }
    }

    #[test_case(3, false ; "lm3_steady")]
    #[test_case(3, true ; "lm3_transient")]
    #[test_case(1, true ; "lm1_transient")]
    #[test_case(0, false ; "lm0")]
    fn test_tf_walk_decodes_what_was_encoded(lm: u8, transient: bool) {
        let mut tf_change = [false; NUM_BANDS];
        for band in [2, 3, 9, 15, 16, 17] {
            tf_change[band] = true;
        }

        let mut enc = RangeEncoder::new(64).unwrap();
        let encoded = code_tf(&mut Coder::Encoder(&mut enc), span(lm), transient, &tf_change, true);
        let bytes = enc.finish().unwrap();

        let mut dec = RangeDecoder::new(&bytes).unwrap();
        let decoded = code_tf(&mut Coder::Decoder(&mut dec), span(lm), transient, &[false; NUM_BANDS], false);

        assert_eq!(decoded, encoded);
        let row = &TF_SELECT_TABLE[usize::from(lm)];
        assert!(encoded.iter().all(|res| row.contains(&(*res as i8))));
    }

    #[test]
    fn test_tf_walk_without_budget_keeps_defaults() {
        let mut tf_change = [true; NUM_BANDS];
        tf_change[0] = false;

        let mut enc = RangeEncoder::new(2).unwrap();
        enc.ec_enc_bits(0, 12);
        let tf_res = code_tf(&mut Coder::Encoder(&mut enc), span(3), false, &tf_change, true);

        assert_eq!(tf_res, [0; NUM_BANDS]);
    }

    #[test]
    fn test_boosts_are_capped_and_mirrored() {
        let caps = init_caps(2, 1);
        let mut requested = [0; NUM_BANDS];
        requested[1] = 2;
        requested[12] = 1;
        requested[20] = 1000;

        let mut enc = RangeEncoder::new(160).unwrap();
        let (encoded, left) =
            code_boosts(&mut Coder::Encoder(&mut enc), span(2), &caps, &requested);
        let bytes = enc.finish().unwrap();

        let mut dec = RangeDecoder::new(&bytes).unwrap();
        let (decoded, decoded_left) =
            code_boosts(&mut Coder::Decoder(&mut dec), span(2), &caps, &[0; NUM_BANDS]);

        assert_eq!(decoded, encoded);
        assert_eq!(decoded_left, left);
        // Narrow bands step by one bit per bin, wide ones by one eighth
        assert_eq!(encoded[1], 2 * (4 << BITRES));
        assert_eq!(encoded[12], 6 << BITRES);
        assert!(encoded[20] >= caps[20]);
        assert!(encoded[20] < caps[20] + 88);
        assert_eq!(encoded[0], 0);
    }
}
