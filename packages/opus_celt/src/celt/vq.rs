//! Algebraic vector quantization of normalized band shapes
//! (RFC 6716 Section 4.3.4).
//!
//! Band shapes are `celt_norm` vectors: Q14 samples with unit L2 norm. A
//! shape is quantized onto the PVQ pyramid of `k` pulses, the codeword is
//! indexed with [`super::cwrs`], and the decoder rescales the integer vector
//! back to the requested gain.
//!
//! Reference: <https://gitlab.xiph.org/xiph/opus/-/blob/34bba701ae97c913de719b1f7c10686f62cddb15/celt/vq.c>

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use crate::range::{RangeDecoder, RangeEncoder};

use super::config::Spread;
use super::cwrs::{decode_pulses, encode_pulses};
use super::math::{
    Q15ONE, add16, celt_atan2p, celt_cos_norm, celt_div, celt_ilog2, celt_rcp, celt_rsqrt_norm,
    celt_sqrt, extract16, mult16_16, mult16_16_p15, mult16_16_q15, mult16_32_q16, pshr32, sub16,
    vshr32,
};

const SPREAD_FACTOR: [usize; 3] = [15, 10, 5];

fn exp_rotation1(x: &mut [i16], stride: usize, c: i32, s: i32) {
    let len = x.len();
    let ms = -s;

    let rotate = |x: &mut [i16], i: usize| {
        let x1 = i32::from(x[i]);
        let x2 = i32::from(x[i + stride]);
        x[i + stride] = extract16(pshr32(mult16_16(c, x2) + mult16_16(s, x1), 15)) as i16;
        x[i] = extract16(pshr32(mult16_16(c, x1) + mult16_16(ms, x2), 15)) as i16;
    };

    for i in 0..len.saturating_sub(stride) {
        rotate(x, i);
    }
    if len > 2 * stride {
        for i in (0..len - 2 * stride).rev() {
            rotate(x, i);
        }
    }
}

/// Applies (`dir > 0`) or undoes (`dir < 0`) the spreading rotation.
///
/// A cascade of two-point Givens rotations whose angle depends on the ratio
/// of pulses to dimensions. `stride` is the number of interleaved short
/// blocks, each rotated on its own.
pub fn exp_rotation(x: &mut [i16], dir: i32, stride: usize, k: usize, spread: Spread) {
    let len = x.len();
    if 2 * k >= len || spread == Spread::None {
        return;
    }
    let factor = SPREAD_FACTOR[spread as usize - 1];

    let gain = extract16(celt_div(
        mult16_16(Q15ONE, len as i32),
        (len + factor * k) as i32,
    ));
    let theta = mult16_16_q15(gain, gain) >> 1;

    let c = celt_cos_norm(theta);
    let s = celt_cos_norm(sub16(Q15ONE, theta));

    let mut stride2 = 0;
    if len >= 8 * stride {
        stride2 = 1;
        // Rounded sqrt(len / stride)
        while (stride2 * stride2 + stride2) * stride + (stride >> 2) < len {
            stride2 += 1;
        }
    }

    let sub_len = len / stride;
    for block in x.chunks_exact_mut(sub_len).take(stride) {
        if dir < 0 {
            if stride2 > 0 {
                exp_rotation1(block, stride2, s, c);
            }
            exp_rotation1(block, 1, c, s);
        } else {
            exp_rotation1(block, 1, c, -s);
            if stride2 > 0 {
                exp_rotation1(block, stride2, s, -c);
            }
        }
    }
}

/// Scales the integer codeword `iy` (squared norm `ryy`) into `x` with the
/// given Q15 gain.
fn normalise_residual(iy: &[i32], x: &mut [i16], ryy: i32, gain: i32) {
    let k = celt_ilog2(ryy) >> 1;
    let t = vshr32(ryy, 2 * (k - 7));
    let g = mult16_16_p15(celt_rsqrt_norm(t), gain);

    for (x, &iy) in x.iter_mut().zip(iy) {
        *x = extract16(pshr32(mult16_16(g, iy), (k + 1) as u32)) as i16;
    }
}

/// One bit per short block, set when the block received at least one pulse.
fn extract_collapse_mask(iy: &[i32], blocks: usize) -> u32 {
    if blocks <= 1 {
        return 1;
    }
    let n0 = iy.len() / blocks;
    iy.chunks_exact(n0)
        .take(blocks)
        .enumerate()
        .fold(0, |mask, (i, block)| {
            mask | (u32::from(block.iter().any(|&v| v != 0)) << i)
        })
}

/// Quantizes `x` onto `k` pulses and writes the codeword.
///
/// Pulses are placed by projecting onto the pyramid when there are many of
/// them, then greedily one at a time maximizing the normalized correlation
/// with `x`. With `resynth_gain` set, `x` is replaced by the decoded shape
/// scaled to that Q15 gain, exactly as [`dequantize`] reconstructs it.
///
/// Returns the collapse mask over `blocks` short blocks.
///
/// # Panics
///
/// * If `k == 0` or `x` has fewer than two entries
pub fn quantize(
    x: &mut [i16],
    k: usize,
    spread: Spread,
    blocks: usize,
    enc: &mut RangeEncoder,
    resynth_gain: Option<i32>,
) -> u32 {
    let n = x.len();
    assert!(k > 0, "quantize needs at least one pulse");
    assert!(n > 1, "quantize needs at least two dimensions");

    exp_rotation(x, 1, blocks, k, spread);

    let negative: Vec<bool> = x.iter().map(|&v| v <= 0).collect();
    for v in x.iter_mut() {
        *v = v.wrapping_abs();
    }
    let mut iy = vec![0_i32; n];
    // Twice the running pulse vector, so the greedy search can add 2y + 1
    let mut y = vec![0_i32; n];

    let k_i32 = k as i32;
    let mut xy = 0_i32;
    let mut yy = 0_i32;
    let mut pulses_left = k_i32;

    if k > n >> 1 {
        let mut sum: i32 = x.iter().map(|&v| i32::from(v)).sum();
        if sum <= k_i32 {
            x[0] = 16384;
            x[1..].fill(0);
            sum = 16384;
        }
        let rcp = extract16(mult16_32_q16(k_i32 - 1, celt_rcp(sum)));
        for j in 0..n {
            let xj = i32::from(x[j]);
            // Rounds towards zero so that the projection never overshoots
            iy[j] = mult16_16_q15(xj, rcp);
            y[j] = iy[j];
            yy = extract16(yy + mult16_16(y[j], y[j]));
            xy += mult16_16(xj, y[j]);
            y[j] *= 2;
            pulses_left -= iy[j];
        }
    }
    debug_assert!(pulses_left >= 0);

    if pulses_left > n as i32 + 3 {
        let tmp = pulses_left;
        yy = extract16(yy + mult16_16(tmp, tmp));
        yy = extract16(yy + mult16_16(tmp, y[0]));
        iy[0] += pulses_left;
        pulses_left = 0;
    }

    for i in 0..pulses_left {
        let rshift = 1 + celt_ilog2(k_i32 - pulses_left + i + 1);
        let mut best_num = -32767;
        let mut best_den = 0;
        let mut best_id = 0;

        yy = add16(yy, 1);
        for j in 0..n {
            let rxy = extract16((xy + i32::from(x[j])) >> rshift);
            let ryy = add16(yy, y[j]);
            let rxy = mult16_16_q15(rxy, rxy);
            // rxy / sqrt(ryy) > best_num / sqrt(best_den), compared without division
            if mult16_16(best_den, rxy) > mult16_16(ryy, best_num) {
                best_den = ryy;
                best_num = rxy;
                best_id = j;
            }
        }

        xy += i32::from(x[best_id]);
        yy = add16(yy, y[best_id]);
        y[best_id] += 2;
        iy[best_id] += 1;
    }

    for ((x, iy), &negative) in x.iter_mut().zip(iy.iter_mut()).zip(&negative) {
        if negative {
            *x = x.wrapping_neg();
            *iy = -*iy;
        }
    }

    encode_pulses(&iy, k, enc);

    if let Some(gain) = resynth_gain {
        normalise_residual(&iy, x, yy, gain);
        exp_rotation(x, -1, blocks, k, spread);
    }

    extract_collapse_mask(&iy, blocks)
}

/// Reads a `k`-pulse codeword into `x`, scaled to the Q15 `gain`.
///
/// Returns the collapse mask over `blocks` short blocks.
///
/// # Panics
///
/// * If `k == 0` or `x` has fewer than two entries
pub fn dequantize(
    x: &mut [i16],
    k: usize,
    spread: Spread,
    blocks: usize,
    dec: &mut RangeDecoder,
    gain: i32,
) -> u32 {
    assert!(k > 0, "dequantize needs at least one pulse");
    assert!(x.len() > 1, "dequantize needs at least two dimensions");

    let mut iy = vec![0_i32; x.len()];
    let ryy = decode_pulses(&mut iy, k, dec);
    normalise_residual(&iy, x, ryy, gain);
    exp_rotation(x, -1, blocks, k, spread);

    extract_collapse_mask(&iy, blocks)
}

/// Rescales `x` to the Q15 `gain`.
pub fn renormalize(x: &mut [i16], gain: i32) {
    let energy = x
        .iter()
        .fold(1_i32, |e, &v| e + mult16_16(i32::from(v), i32::from(v)));
    let k = celt_ilog2(energy) >> 1;
    let t = vshr32(energy, 2 * (k - 7));
    let g = mult16_16_p15(celt_rsqrt_norm(t), gain);

    for v in x.iter_mut() {
        *v = extract16(pshr32(mult16_16(g, i32::from(*v)), (k + 1) as u32)) as i16;
    }
}

/// Angle between two vectors in Q14 (`16384` is pi/2).
///
/// For `stereo`, `x` and `y` are the left and right channels and the angle is
/// measured between their mid and side.
#[must_use]
pub fn stereo_itheta(x: &[i16], y: &[i16], stereo: bool) -> i32 {
    let (mut emid, mut eside) = (1_i32, 1_i32);
    for (&l, &r) in x.iter().zip(y) {
        let (l, r) = (i32::from(l), i32::from(r));
        let (m, s) = if stereo {
            (add16(l >> 1, r >> 1), sub16(l >> 1, r >> 1))
        } else {
            (l, r)
        };
        emid += mult16_16(m, m);
        eside += mult16_16(s, s);
    }

    let mid = celt_sqrt(emid);
    let side = celt_sqrt(eside);
    // 0.63662 = 2/pi
    mult16_16_q15(20861, celt_atan2p(side, mid))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
    use test_case::test_case;

    use super::*;
    use crate::celt::rate::fits_in32;

    fn random_shape(rng: &mut StdRng, n: usize) -> Vec<i16> {
        let mut x: Vec<i16> = (0..n).map(|_| rng.random_range(-8000..=8000)).collect();
        renormalize(&mut x, Q15ONE);
        x
    }

    fn energy(x: &[i16]) -> i64 {
        x.iter().map(|&v| i64::from(v) * i64::from(v)).sum()
    }

    #[test]
    fn test_quantize_matches_dequantize_and_preserves_gain() {
        let mut rng = StdRng::seed_from_u64(1);
        let sizes = [2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 176];

        for _ in 0..300 {
            let n = sizes[rng.random_range(0..sizes.len())];
            let mut k = rng.random_range(1..=40.min((300 / n).max(1)));
            while !fits_in32(n, k) {
                k -= 1;
            }
            let blocks = [1, 2, 4, 8]
                .into_iter()
                .filter(|b| n % b == 0)
                .nth(rng.random_range(0..2))
                .unwrap_or(1);
            let spread = Spread::from_symbol(rng.random_range(0..4));

            let mut x = random_shape(&mut rng, n);
            let mut encoder = RangeEncoder::new(64).unwrap();
            let mask = quantize(&mut x, k, spread, blocks, &mut encoder, Some(Q15ONE));
            let frame = encoder.finish().unwrap();

            let mut decoder = RangeDecoder::new(&frame).unwrap();
            let mut decoded = vec![0; n];
            let decoded_mask = dequantize(&mut decoded, k, spread, blocks, &mut decoder, Q15ONE);

            assert_eq!(decoded, x, "n={n} k={k} blocks={blocks} spread={spread:?}");
            assert_eq!(decoded_mask, mask);

            let e = energy(&decoded);
            let target = 1_i64 << 28;
            assert!((e - target).abs() < target / 100, "energy {e} for n={n} k={k}");
        }
    }

    #[test]
    fn test_exp_rotation_is_nearly_invertible() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let n = [4, 8, 16, 32, 64, 176][rng.random_range(0..6)];
            let k = rng.random_range(1..n / 2);
            let spread = Spread::from_symbol(rng.random_range(1..4));
            let original = random_shape(&mut rng, n);

            let mut x = original.clone();
            exp_rotation(&mut x, 1, 1, k, spread);
            exp_rotation(&mut x, -1, 1, k, spread);

            for (a, b) in x.iter().zip(&original) {
                assert!((i32::from(*a) - i32::from(*b)).abs() <= 32);
            }
        }
    }

    #[test]
    fn test_exp_rotation_skipped_for_dense_codewords() {
        let mut x = vec![100, -200, 300, -400];
        exp_rotation(&mut x, 1, 1, 2, Spread::Aggressive);
        assert_eq!(x, vec![100, -200, 300, -400]);
        exp_rotation(&mut x, 1, 1, 1, Spread::None);
        assert_eq!(x, vec![100, -200, 300, -400]);
    }

    #[test_case(&[1, 0, 0, 0], 1, 1 ; "single_block")]
    #[test_case(&[0, 0, 3, -1], 2, 0b10 ; "second_block")]
    #[test_case(&[1, 0, 0, 0, 0, -2, 0, 0], 4, 0b0101 ; "interleaved_blocks")]
    #[test_case(&[0, 0, 0, 0], 2, 0 ; "empty")]
    fn test_extract_collapse_mask(iy: &[i32], blocks: usize, expected: u32) {
        assert_eq!(extract_collapse_mask(iy, blocks), expected);
    }

    #[test_case(Q15ONE, 1 << 28 ; "unit_gain")]
    #[test_case(16384, 1 << 26 ; "half_gain")]
    fn test_renormalize_energy(gain: i32, target: i64) {
        let mut rng = StdRng::seed_from_u64(3);
        let mut x: Vec<i16> = (0..32).map(|_| rng.random_range(-8000..=8000)).collect();
        renormalize(&mut x, gain);
        let e = energy(&x);
        assert!((e - target).abs() < target / 500, "energy {e}");
    }

    #[test]
    fn test_quantize_all_zero_shape_puts_pulses_first() {
        let mut x = vec![0_i16; 8];
        let mut encoder = RangeEncoder::new(16).unwrap();
        let mask = quantize(&mut x, 6, Spread::None, 1, &mut encoder, Some(Q15ONE));
        assert_eq!(mask, 1);
        // Zero samples count as negative, so the projected pulse is negative
        assert!(x[0] < 0);
        assert!(x[1..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_stereo_itheta_extremes() {
        let x = [16384_i16, 0, 0, 0];
        let zero = [0_i16; 4];
        assert_eq!(stereo_itheta(&x, &zero, false), 0);
        assert_eq!(stereo_itheta(&zero, &x, false), 16384);
        // Identical channels have no side component
        assert_eq!(stereo_itheta(&x, &x, true), 0);
    }
}
