//! Band shape coding (RFC 6716 Section 4.3.4).
//!
//! Each band is split recursively in time or between mid and side until its
//! budget fits a single PVQ codebook. The split angle is coded at every level
//! and the remaining bits are shared between the halves. Bands that receive
//! no pulses are filled by folding an earlier band or with noise, and the
//! collapse masks produced here later drive [`anti_collapse`].
//!
//! Reference: <https://gitlab.xiph.org/xiph/opus/-/blob/34bba701ae97c913de719b1f7c10686f62cddb15/celt/bands.c>

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::too_many_lines
)]

use crate::range::{BITRES, Coder};

use super::config::Spread;
use super::constants::{
    BIT_DEINTERLEAVE_TABLE, BIT_INTERLEAVE_TABLE, E_MEANS, EBANDS, EXP2_TABLE8, LOG_N, NUM_BANDS,
    ORDERY_TABLE,
};
use super::energy::EnergyState;
use super::math::{
    DB_SHIFT, Q15ONE, add16, bitexact_cos, bitexact_log2tan, celt_exp2, celt_exp2_frac,
    celt_ilog2, celt_lcg_rand, celt_rcp, celt_rsqrt_norm, celt_sqrt, celt_zlog2, extract16,
    frac_mul16, half32, mult16_16, mult16_16_p15, mult16_16_q14, mult16_16_q15, mult16_32_q15,
    pshr32, sub16, vshr32,
};
use super::rate::{
    QTHETA_OFFSET, QTHETA_OFFSET_TWOPHASE, bits2pulses, get_pulses, max_pulse_bits, pulses2bits,
};
use super::vq;

/// Unit norm of a band shape, `1.0` in Q14.
pub const NORM_SCALING: i16 = 16384;

/// Everything [`quant_all_bands`] needs beyond the spectrum itself.
#[derive(Debug, Clone, Copy)]
pub struct BandsRequest<'a> {
    pub start: usize,
    pub end: usize,
    pub lm: u8,
    pub short_blocks: bool,
    pub spread: Spread,
    pub dual_stereo: bool,
    pub intensity: usize,
    /// Time-frequency resolution change per band.
    pub tf_res: &'a [i32; NUM_BANDS],
    /// Shape budget per band in 1/8 bits, from the allocator.
    pub pulses: &'a [i32; NUM_BANDS],
    /// Frame size in 1/8 bits, less the anti-collapse reservation.
    pub total_bits: i32,
    pub balance: i32,
    pub coded_bands: usize,
    /// Linear band amplitudes, only read by the encoder for intensity stereo.
    pub band_e: &'a [[i32; NUM_BANDS]; 2],
    /// Reconstruct the quantized shapes in place.
    pub resynth: bool,
}

/// Per-band outcome of [`quant_all_bands`]: one bit per short block that
/// received energy, for each channel.
pub type CollapseMasks = [[u8; 2]; NUM_BANDS];

struct BandContext<'c, 'a> {
    coder: &'c mut Coder<'a>,
    resynth: bool,
    band: usize,
    intensity: usize,
    spread: Spread,
    tf_change: i32,
    remaining_bits: i32,
    band_e: &'c [[i32; NUM_BANDS]; 2],
    seed: u32,
}

/// Outcome of coding a split angle.
struct Split {
    inv: bool,
    imid: i32,
    iside: i32,
    delta: i32,
    itheta: i32,
    qalloc: i32,
}

/// Resolution of the split angle for a band of `n` bins given `b` bits.
fn compute_qn(n: i32, b: i32, offset: i32, pulse_cap: i32, stereo: bool) -> i32 {
    let mut n2 = 2 * n - 1;
    if stereo && n == 2 {
        n2 -= 1;
    }
    // The upper limit keeps the angle from eating more than half the bits
    let qb = (b - pulse_cap - (4 << BITRES))
        .min((b + n2 * offset) / n2)
        .min(8 << BITRES);

    if qb < (1 << BITRES >> 1) {
        1
    } else {
        let qn = EXP2_TABLE8[(qb & 0x7) as usize] >> (14 - (qb >> BITRES));
        ((qn + 1) >> 1) << 1
    }
}

/// One level of the orthonormal Haar transform over `stride` interleaved
/// vectors of `n0` bins.
pub(crate) fn haar1(x: &mut [i16], n0: usize, stride: usize) {
    let n0 = n0 >> 1;
    for i in 0..stride {
        for j in 0..n0 {
            let a = stride * 2 * j + i;
            let b = stride * (2 * j + 1) + i;
            let tmp1 = mult16_16_q15(23170, i32::from(x[a]));
            let tmp2 = mult16_16_q15(23170, i32::from(x[b]));
            x[a] = add16(tmp1, tmp2) as i16;
            x[b] = sub16(tmp1, tmp2) as i16;
        }
    }
}

/// Groups the bins of each of the `stride` interleaved blocks together,
/// optionally in Hadamard order.
pub(crate) fn deinterleave_hadamard(x: &mut [i16], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    let mut tmp = vec![0_i16; n];
    if hadamard {
        let ordery = &ORDERY_TABLE[stride - 2..];
        for i in 0..stride {
            for j in 0..n0 {
                tmp[ordery[i] * n0 + j] = x[j * stride + i];
            }
        }
    } else {
        for i in 0..stride {
            for j in 0..n0 {
                tmp[i * n0 + j] = x[j * stride + i];
            }
        }
    }
    x[..n].copy_from_slice(&tmp);
}

/// Inverse of [`deinterleave_hadamard`].
pub(crate) fn interleave_hadamard(x: &mut [i16], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    let mut tmp = vec![0_i16; n];
    if hadamard {
        let ordery = &ORDERY_TABLE[stride - 2..];
        for i in 0..stride {
            for j in 0..n0 {
                tmp[j * stride + i] = x[ordery[i] * n0 + j];
            }
        }
    } else {
        for i in 0..stride {
            for j in 0..n0 {
                tmp[j * stride + i] = x[i * n0 + j];
            }
        }
    }
    x[..n].copy_from_slice(&tmp);
}

/// Folds both channels into `x` weighted by their band amplitudes.
fn intensity_stereo(x: &mut [i16], y: &[i16], band_e: &[[i32; NUM_BANDS]; 2], band: usize) {
    let (el, er) = (band_e[0][band], band_e[1][band]);
    let shift = celt_zlog2(el.max(er)) - 13;
    let left = extract16(vshr32(el, shift));
    let right = extract16(vshr32(er, shift));
    let norm = extract16(1 + celt_sqrt(1 + mult16_16(left, left) + mult16_16(right, right)));
    let a1 = extract16((left << 14) / norm);
    let a2 = extract16((right << 14) / norm);

    for (l, &r) in x.iter_mut().zip(y) {
        let mixed = mult16_16(a1, i32::from(*l)) + mult16_16(a2, i32::from(r));
        *l = extract16(mixed >> 14) as i16;
    }
}

/// Rotates left/right into mid/side.
fn stereo_split(x: &mut [i16], y: &mut [i16]) {
    for (l, r) in x.iter_mut().zip(y.iter_mut()) {
        let lv = mult16_16(23170, i32::from(*l));
        let rv = mult16_16(23170, i32::from(*r));
        *l = extract16((lv + rv) >> 15) as i16;
        *r = extract16((rv - lv) >> 15) as i16;
    }
}

/// Turns the decoded mid (scaled by `mid`) and unit side back into left and
/// right with unit norm each.
fn stereo_merge(x: &mut [i16], y: &mut [i16], mid: i32) {
    let (mut xp, mut side) = (0_i32, 0_i32);
    for (&l, &r) in x.iter().zip(y.iter()) {
        xp = xp.wrapping_add(mult16_16(i32::from(l), i32::from(r)));
        side = side.wrapping_add(mult16_16(i32::from(r), i32::from(r)));
    }
    let xp = mult16_32_q15(mid, xp);
    let mid2 = mid >> 1;
    let el = mult16_16(mid2, mid2) + side - 2 * xp;
    let er = mult16_16(mid2, mid2) + side + 2 * xp;

    // 6e-4 in Q28
    if er < 161_061 || el < 161_061 {
        y.copy_from_slice(x);
        return;
    }

    let kl = celt_ilog2(el) >> 1;
    let kr = celt_ilog2(er) >> 1;
    let lgain = celt_rsqrt_norm(vshr32(el, (kl - 7) << 1));
    let rgain = celt_rsqrt_norm(vshr32(er, (kr - 7) << 1));
    let kl = kl.max(7);
    let kr = kr.max(7);

    for (l, r) in x.iter_mut().zip(y.iter_mut()) {
        let lv = mult16_16_q15(mid, i32::from(*l));
        let rv = i32::from(*r);
        *l = extract16(pshr32(mult16_16(lgain, sub16(lv, rv)), (kl + 1) as u32)) as i16;
        *r = extract16(pshr32(mult16_16(rgain, add16(lv, rv)), (kr + 1) as u32)) as i16;
    }
}

impl BandContext<'_, '_> {
    /// Codes the split angle of `x`/`y` and applies the encoder's stereo
    /// rotation. `b` is reduced by the bits the angle took.
    fn compute_theta(
        &mut self,
        x: &mut [i16],
        y: &mut [i16],
        b: &mut i32,
        blocks: usize,
        b0: usize,
        lm: i32,
        stereo: bool,
        fill: &mut u32,
    ) -> Split {
        let n = x.len() as i32;
        let encode = self.coder.is_encoder();

        let pulse_cap = LOG_N[self.band] + (lm << BITRES);
        let offset = (pulse_cap >> 1)
            - if stereo && n == 2 {
                QTHETA_OFFSET_TWOPHASE
            } else {
                QTHETA_OFFSET
            };
        let mut qn = compute_qn(n, *b, offset, pulse_cap, stereo);
        if stereo && self.band >= self.intensity {
            qn = 1;
        }

        let mut itheta = if encode {
            vq::stereo_itheta(x, y, stereo)
        } else {
            0
        };
        let tell = self.coder.tell_frac();
        let mut inv = false;

        if qn != 1 {
            if encode {
                itheta = (itheta * qn + 8192) >> 14;
            }
            if stereo && n > 2 {
                itheta = self.code_theta_step(itheta, qn);
            } else if b0 > 1 || stereo {
                itheta = self.coder.code_uint(itheta as u32, (qn + 1) as u32) as i32;
            } else {
                itheta = self.code_theta_triangular(itheta, qn);
            }
            itheta = itheta * 16384 / qn;

            if encode && stereo {
                if itheta == 0 {
                    intensity_stereo(x, y, self.band_e, self.band);
                } else {
                    stereo_split(x, y);
                }
            }
        } else if stereo {
            if encode {
                inv = itheta > 8192;
                if inv {
                    for v in y.iter_mut() {
                        *v = v.wrapping_neg();
                    }
                }
                intensity_stereo(x, y, self.band_e, self.band);
            }
            inv = if *b > 2 << BITRES && self.remaining_bits > 2 << BITRES {
                self.coder.code_bit_logp(inv, 2)
            } else {
                false
            };
            itheta = 0;
        }

        let qalloc = self.coder.tell_frac() - tell;
        *b -= qalloc;

        let (imid, iside, delta) = if itheta == 0 {
            *fill &= (1 << blocks) - 1;
            (32767, 0, -16384)
        } else if itheta == 16384 {
            *fill &= ((1 << blocks) - 1) << blocks;
            (0, 32767, 16384)
        } else {
            let imid = bitexact_cos(itheta);
            let iside = bitexact_cos(16384 - itheta);
            // Mid/side bit split in 1/8 bits
            let delta = frac_mul16((n - 1) << 7, bitexact_log2tan(iside, imid));
            (imid, iside, delta)
        };

        Split {
            inv,
            imid,
            iside,
            delta,
            itheta,
            qalloc,
        }
    }

    /// Stereo angle with a step pdf favouring values near `qn / 2`.
    fn code_theta_step(&mut self, itheta: i32, qn: i32) -> i32 {
        const P0: i32 = 3;
        let x0 = qn / 2;
        let ft = (P0 * (x0 + 1) + x0) as u32;
        let bounds = |x: i32| {
            if x <= x0 {
                (P0 * x, P0 * (x + 1))
            } else {
                ((x - 1 - x0) + (x0 + 1) * P0, (x - x0) + (x0 + 1) * P0)
            }
        };

        match self.coder {
            Coder::Encoder(enc) => {
                let (fl, fh) = bounds(itheta);
                enc.ec_encode(fl as u32, fh as u32, ft);
                itheta
            }
            Coder::Decoder(dec) => {
                let fs = dec.ec_decode(ft) as i32;
                let x = if fs < (x0 + 1) * P0 {
                    fs / P0
                } else {
                    x0 + 1 + (fs - (x0 + 1) * P0)
                };
                let (fl, fh) = bounds(x);
                dec.ec_dec_update(fl as u32, fh as u32, ft);
                x
            }
        }
    }

    /// Mono time split angle with a triangular pdf peaking at `qn / 2`.
    fn code_theta_triangular(&mut self, itheta: i32, qn: i32) -> i32 {
        let half = qn >> 1;
        let ft = (half + 1) * (half + 1);

        match self.coder {
            Coder::Encoder(enc) => {
                let (fl, fs) = if itheta <= half {
                    ((itheta * (itheta + 1)) >> 1, itheta + 1)
                } else {
                    (
                        ft - (((qn + 1 - itheta) * (qn + 2 - itheta)) >> 1),
                        qn + 1 - itheta,
                    )
                };
                enc.ec_encode(fl as u32, (fl + fs) as u32, ft as u32);
                itheta
            }
            Coder::Decoder(dec) => {
                let fm = dec.ec_decode(ft as u32) as i32;
                let (itheta, fl, fs) = if fm < (half * (half + 1)) >> 1 {
                    let itheta = (((8 * fm + 1) as u32).isqrt() as i32 - 1) >> 1;
                    (itheta, (itheta * (itheta + 1)) >> 1, itheta + 1)
                } else {
                    let root = ((8 * (ft - fm - 1) + 1) as u32).isqrt() as i32;
                    let itheta = (2 * (qn + 1) - root) >> 1;
                    (
                        itheta,
                        ft - (((qn + 1 - itheta) * (qn + 2 - itheta)) >> 1),
                        qn + 1 - itheta,
                    )
                };
                dec.ec_dec_update(fl as u32, (fl + fs) as u32, ft as u32);
                itheta
            }
        }
    }

    fn code_n1_sign(&mut self, v: &mut i16) {
        let mut negative = false;
        if self.remaining_bits >= 1 << BITRES {
            negative = self.coder.code_bits(u32::from(*v < 0), 1) != 0;
            self.remaining_bits -= 1 << BITRES;
        }
        if self.resynth {
            *v = if negative { -NORM_SCALING } else { NORM_SCALING };
        }
    }

    /// Single-bin bands only carry a sign.
    fn quant_band_n1(
        &mut self,
        x: &mut [i16],
        y: Option<&mut [i16]>,
        lowband_out: Option<&mut [i16]>,
    ) -> u32 {
        self.code_n1_sign(&mut x[0]);
        if let Some(y) = y {
            self.code_n1_sign(&mut y[0]);
        }
        if let Some(out) = lowband_out {
            out[0] = x[0] >> 4;
        }
        1
    }

    /// Codes a mono partition, splitting it in two while its budget exceeds
    /// the largest codebook.
    fn quant_partition(
        &mut self,
        x: &mut [i16],
        b: i32,
        blocks: usize,
        lowband: Option<&mut [i16]>,
        lm: i32,
        gain: i32,
        fill: u32,
    ) -> u32 {
        let n = x.len();
        let b0 = blocks;

        if lm != -1 && n > 2 && b > max_pulse_bits(self.band, lm) + 12 {
            let half = n >> 1;
            let (x, y) = x.split_at_mut(half);
            let lm = lm - 1;
            let mut fill = fill;
            if blocks == 1 {
                fill = (fill & 1) | (fill << 1);
            }
            let blocks = (blocks + 1) >> 1;

            let mut b = b;
            let split = self.compute_theta(x, y, &mut b, blocks, b0, lm, false, &mut fill);
            let mut delta = split.delta;

            // Transients get a bias towards the louder half
            if b0 > 1 && split.itheta & 0x3fff != 0 {
                if split.itheta > 8192 {
                    delta -= delta >> (4 - lm);
                } else {
                    delta = 0.min(delta + (((half as i32) << BITRES) >> (5 - lm)));
                }
            }
            let mut mbits = 0.max(b.min((b - delta) / 2));
            let mut sbits = b - mbits;
            self.remaining_bits -= split.qalloc;

            let (lowband_lo, lowband_hi) = match lowband {
                Some(lowband) => {
                    let (lo, hi) = lowband.split_at_mut(half);
                    (Some(lo), Some(hi))
                }
                None => (None, None),
            };

            let rebalance_start = self.remaining_bits;
            let mid_gain = mult16_16_p15(gain, split.imid);
            let side_gain = mult16_16_p15(gain, split.iside);
            let mut cm;
            if mbits >= sbits {
                cm = self.quant_partition(x, mbits, blocks, lowband_lo, lm, mid_gain, fill);
                let rebalance = mbits - (rebalance_start - self.remaining_bits);
                if rebalance > 3 << BITRES && split.itheta != 0 {
                    sbits += rebalance - (3 << BITRES);
                }
                cm |= self.quant_partition(y, sbits, blocks, lowband_hi, lm, side_gain, fill >> blocks)
                    << (b0 >> 1);
            } else {
                cm = self.quant_partition(y, sbits, blocks, lowband_hi, lm, side_gain, fill >> blocks)
                    << (b0 >> 1);
                let rebalance = sbits - (rebalance_start - self.remaining_bits);
                if rebalance > 3 << BITRES && split.itheta != 16384 {
                    mbits += rebalance - (3 << BITRES);
                }
                cm |= self.quant_partition(x, mbits, blocks, lowband_lo, lm, mid_gain, fill);
            }
            return cm;
        }

        let mut q = bits2pulses(self.band, lm, b);
        let mut curr_bits = pulses2bits(self.band, lm, q);
        self.remaining_bits -= curr_bits;

        // Never bust the budget
        while self.remaining_bits < 0 && q > 0 {
            self.remaining_bits += curr_bits;
            q -= 1;
            curr_bits = pulses2bits(self.band, lm, q);
            self.remaining_bits -= curr_bits;
        }

        if q != 0 {
            let k = get_pulses(q as usize);
            return match self.coder {
                Coder::Encoder(enc) => {
                    vq::quantize(x, k, self.spread, blocks, enc, self.resynth.then_some(gain))
                }
                Coder::Decoder(dec) => vq::dequantize(x, k, self.spread, blocks, dec, gain),
            };
        }

        if !self.resynth {
            return 0;
        }

        let cm_mask = (1_u32 << blocks) - 1;
        let fill = fill & cm_mask;
        if fill == 0 {
            x.fill(0);
            return 0;
        }

        let cm = match lowband {
            None => {
                for v in x.iter_mut() {
                    self.seed = celt_lcg_rand(self.seed);
                    *v = ((self.seed as i32) >> 20) as i16;
                }
                cm_mask
            }
            Some(lowband) => {
                // About 48 dB below the folded band
                for (v, &l) in x.iter_mut().zip(lowband.iter()) {
                    self.seed = celt_lcg_rand(self.seed);
                    let tmp = if self.seed & 0x8000 == 0 { -4 } else { 4 };
                    *v = (i32::from(l) + tmp) as i16;
                }
                fill
            }
        };
        vq::renormalize(x, gain);
        cm
    }

    /// Codes a mono band after adapting its time-frequency resolution.
    fn quant_band(
        &mut self,
        x: &mut [i16],
        b: i32,
        blocks: usize,
        mut lowband: Option<&mut [i16]>,
        lm: i32,
        lowband_out: Option<&mut [i16]>,
        gain: i32,
        fill: u32,
    ) -> u32 {
        let n0 = x.len();
        if n0 == 1 {
            return self.quant_band_n1(x, None, lowband_out);
        }

        let encode = self.coder.is_encoder();
        let long_blocks = blocks == 1;
        let mut blocks = blocks;
        let mut n_b = n0 / blocks;
        let mut tf_change = self.tf_change;
        let mut fill = fill;
        let recombine = tf_change.max(0) as usize;

        for k in 0..recombine {
            if encode {
                haar1(x, n0 >> k, 1 << k);
            }
            if let Some(lowband) = lowband.as_deref_mut() {
                haar1(lowband, n0 >> k, 1 << k);
            }
            fill = u32::from(BIT_INTERLEAVE_TABLE[(fill & 0xF) as usize])
                | (u32::from(BIT_INTERLEAVE_TABLE[(fill >> 4) as usize]) << 2);
        }
        blocks >>= recombine;
        n_b <<= recombine;

        let mut time_divide = 0;
        while n_b & 1 == 0 && tf_change < 0 {
            if encode {
                haar1(x, n_b, blocks);
            }
            if let Some(lowband) = lowband.as_deref_mut() {
                haar1(lowband, n_b, blocks);
            }
            fill |= fill << blocks;
            blocks <<= 1;
            n_b >>= 1;
            time_divide += 1;
            tf_change += 1;
        }
        let b0 = blocks;
        let n_b0 = n_b;

        if b0 > 1 {
            if encode {
                deinterleave_hadamard(x, n_b >> recombine, b0 << recombine, long_blocks);
            }
            if let Some(lowband) = lowband.as_deref_mut() {
                deinterleave_hadamard(lowband, n_b >> recombine, b0 << recombine, long_blocks);
            }
        }

        let mut cm = self.quant_partition(x, b, blocks, lowband, lm, gain, fill);

        if self.resynth {
            if b0 > 1 {
                interleave_hadamard(x, n_b >> recombine, b0 << recombine, long_blocks);
            }

            let mut n_b = n_b0;
            let mut blocks = b0;
            for _ in 0..time_divide {
                blocks >>= 1;
                n_b <<= 1;
                cm |= cm >> blocks;
                haar1(x, n_b, blocks);
            }

            for k in 0..recombine {
                cm = u32::from(BIT_DEINTERLEAVE_TABLE[(cm & 0xF) as usize]);
                haar1(x, n0 >> k, 1 << k);
            }
            blocks <<= recombine;

            // Scaled so that folding sees unit energy per bin
            if let Some(out) = lowband_out {
                let scale = celt_sqrt((n0 as i32) << 22);
                for (o, &v) in out.iter_mut().zip(x.iter()) {
                    *o = mult16_16_q15(scale, i32::from(v)) as i16;
                }
            }
            cm &= (1 << blocks) - 1;
        }
        cm
    }

    /// Codes a stereo band as mid and side.
    fn quant_band_stereo(
        &mut self,
        x: &mut [i16],
        y: &mut [i16],
        b: i32,
        blocks: usize,
        lowband: Option<&mut [i16]>,
        lm: i32,
        lowband_out: Option<&mut [i16]>,
        fill: u32,
    ) -> u32 {
        let n = x.len();
        if n == 1 {
            return self.quant_band_n1(x, Some(y), lowband_out);
        }

        let orig_fill = fill;
        let mut fill = fill;
        let mut b = b;
        let split = self.compute_theta(x, y, &mut b, blocks, blocks, lm, true, &mut fill);
        let (mid, side) = (split.imid, split.iside);
        let mut cm;

        if n == 2 {
            // One of the two channels is coded as a rotated copy of the other
            let sbits = if split.itheta != 0 && split.itheta != 16384 {
                1 << BITRES
            } else {
                0
            };
            let mbits = b - sbits;
            let swap = split.itheta > 8192;
            self.remaining_bits -= split.qalloc + sbits;

            {
                let (x2, y2) = if swap {
                    (&mut *y, &mut *x)
                } else {
                    (&mut *x, &mut *y)
                };
                let mut sign = 0;
                if sbits != 0 {
                    let cross = i32::from(x2[0]) * i32::from(y2[1])
                        - i32::from(x2[1]) * i32::from(y2[0]);
                    sign = self.coder.code_bits(u32::from(cross < 0), 1) as i32;
                }
                let sign = 1 - 2 * sign;
                cm = self.quant_band(x2, mbits, blocks, lowband, lm, lowband_out, Q15ONE, orig_fill);
                y2[0] = (-sign * i32::from(x2[1])) as i16;
                y2[1] = (sign * i32::from(x2[0])) as i16;
            }

            if self.resynth {
                let x0 = mult16_16_q15(mid, i32::from(x[0]));
                let x1 = mult16_16_q15(mid, i32::from(x[1]));
                let y0 = mult16_16_q15(side, i32::from(y[0]));
                let y1 = mult16_16_q15(side, i32::from(y[1]));
                x[0] = sub16(x0, y0) as i16;
                y[0] = add16(x0, y0) as i16;
                x[1] = sub16(x1, y1) as i16;
                y[1] = add16(x1, y1) as i16;
            }
        } else {
            let mut mbits = 0.max(b.min((b - split.delta) / 2));
            let mut sbits = b - mbits;
            self.remaining_bits -= split.qalloc;

            let rebalance_start = self.remaining_bits;
            if mbits >= sbits {
                cm = self.quant_band(x, mbits, blocks, lowband, lm, lowband_out, Q15ONE, fill);
                let rebalance = mbits - (rebalance_start - self.remaining_bits);
                if rebalance > 3 << BITRES && split.itheta != 0 {
                    sbits += rebalance - (3 << BITRES);
                }
                // The side never folds: it has no lowband
                cm |= self.quant_band(y, sbits, blocks, None, lm, None, side, fill >> blocks);
            } else {
                cm = self.quant_band(y, sbits, blocks, None, lm, None, side, fill >> blocks);
                let rebalance = sbits - (rebalance_start - self.remaining_bits);
                if rebalance > 3 << BITRES && split.itheta != 16384 {
                    mbits += rebalance - (3 << BITRES);
                }
                cm |= self.quant_band(x, mbits, blocks, lowband, lm, lowband_out, Q15ONE, fill);
            }
        }

        if self.resynth {
            if n != 2 {
                stereo_merge(x, y, mid);
            }
            if split.inv {
                for v in y.iter_mut() {
                    *v = v.wrapping_neg();
                }
            }
        }
        cm
    }
}

/// Codes the normalized shapes of bands `start..end` for one frame.
///
/// `x` and `y` hold `120 << lm` bins per channel; `y` is present for stereo.
/// With `resynth` the quantized shapes replace the input, which is always
/// the case on the decoder. `seed` is the folding noise generator state and
/// is advanced in place.
///
/// Returns the collapse mask of every band.
pub fn quant_all_bands(
    request: &BandsRequest<'_>,
    x: &mut [i16],
    mut y: Option<&mut [i16]>,
    coder: &mut Coder<'_>,
    seed: &mut u32,
) -> CollapseMasks {
    let BandsRequest {
        start,
        end,
        lm,
        short_blocks,
        spread,
        intensity,
        tf_res,
        pulses,
        total_bits,
        coded_bands,
        band_e,
        ..
    } = *request;
    let resynth = request.resynth || !coder.is_encoder();
    let channels = if y.is_some() { 2 } else { 1 };

    let m = 1_usize << lm;
    let blocks = if short_blocks { m } else { 1 };
    let norm_offset = m * EBANDS[start];
    // The last band is never folded from, so it is not kept
    let norm_len = m * EBANDS[NUM_BANDS - 1] - norm_offset;
    let mut norm_buf = vec![0_i16; channels * norm_len];
    let (norm, norm2) = norm_buf.split_at_mut(norm_len);

    let mut ctx = BandContext {
        coder,
        resynth,
        band: start,
        intensity,
        spread,
        tf_change: 0,
        remaining_bits: 0,
        band_e,
        seed: *seed,
    };

    let mut collapse_masks = [[0_u8; 2]; NUM_BANDS];
    let mut lowband_offset = 0;
    let mut update_lowband = true;
    let mut balance = request.balance;
    let mut dual_stereo = request.dual_stereo;

    for i in start..end {
        ctx.band = i;
        let last = i == end - 1;
        let band_start = m * EBANDS[i];
        let n = m * EBANDS[i + 1] - band_start;

        let tell = ctx.coder.tell_frac();
        if i != start {
            balance -= tell;
        }
        let remaining_bits = total_bits - tell - 1;
        ctx.remaining_bits = remaining_bits;

        let b = if i < coded_bands {
            let curr_balance = balance / 3.min((coded_bands - i) as i32);
            0.max(16383.min((remaining_bits + 1).min(pulses[i] + curr_balance)))
        } else {
            0
        };

        if resynth
            && band_start >= n + m * EBANDS[start]
            && (update_lowband || lowband_offset == 0)
        {
            lowband_offset = i;
        }

        ctx.tf_change = tf_res[i];

        let mut effective_lowband = None;
        let (mut x_cm, mut y_cm);
        if lowband_offset != 0 && (spread != Spread::Aggressive || blocks > 1 || tf_res[i] < 0) {
            // Fold from the bins just below this band, as far as they exist
            let eff = (m * EBANDS[lowband_offset]).saturating_sub(norm_offset + n);
            effective_lowband = Some(eff);

            let mut fold_start = lowband_offset;
            loop {
                fold_start -= 1;
                if m * EBANDS[fold_start] <= eff + norm_offset {
                    break;
                }
            }
            let mut fold_end = lowband_offset - 1;
            loop {
                fold_end += 1;
                if m * EBANDS[fold_end] >= eff + norm_offset + n {
                    break;
                }
            }

            x_cm = 0;
            y_cm = 0;
            for masks in &collapse_masks[fold_start..fold_end] {
                x_cm |= u32::from(masks[0]);
                y_cm |= u32::from(masks[channels - 1]);
            }
        } else {
            // Without folding every block is considered filled
            x_cm = (1 << blocks) - 1;
            y_cm = x_cm;
        }

        if dual_stereo && i == intensity {
            dual_stereo = false;
            if resynth {
                for (l, &r) in norm[..band_start - norm_offset].iter_mut().zip(norm2.iter()) {
                    *l = half32(i32::from(*l) + i32::from(r)) as i16;
                }
            }
        }

        let lowband_copy =
            |buf: &[i16]| effective_lowband.map(|eff| buf[eff..eff + n].to_vec());
        let out_start = band_start - norm_offset;
        let x_band = &mut x[band_start..band_start + n];

        match y.as_deref_mut() {
            Some(y) if dual_stereo => {
                let y_band = &mut y[band_start..band_start + n];
                let mut lowband = lowband_copy(&norm[..]);
                let out = (!last).then(|| &mut norm[out_start..out_start + n]);
                x_cm = ctx.quant_band(
                    x_band,
                    b / 2,
                    blocks,
                    lowband.as_deref_mut(),
                    i32::from(lm),
                    out,
                    Q15ONE,
                    x_cm,
                );
                let mut lowband = lowband_copy(&norm2[..]);
                let out = (!last).then(|| &mut norm2[out_start..out_start + n]);
                y_cm = ctx.quant_band(
                    y_band,
                    b / 2,
                    blocks,
                    lowband.as_deref_mut(),
                    i32::from(lm),
                    out,
                    Q15ONE,
                    y_cm,
                );
            }
            Some(y) => {
                let y_band = &mut y[band_start..band_start + n];
                let mut lowband = lowband_copy(&norm[..]);
                let out = (!last).then(|| &mut norm[out_start..out_start + n]);
                x_cm = ctx.quant_band_stereo(
                    x_band,
                    y_band,
                    b,
                    blocks,
                    lowband.as_deref_mut(),
                    i32::from(lm),
                    out,
                    x_cm | y_cm,
                );
                y_cm = x_cm;
            }
            None => {
                let mut lowband = lowband_copy(&norm[..]);
                let out = (!last).then(|| &mut norm[out_start..out_start + n]);
                x_cm = ctx.quant_band(
                    x_band,
                    b,
                    blocks,
                    lowband.as_deref_mut(),
                    i32::from(lm),
                    out,
                    Q15ONE,
                    x_cm | y_cm,
                );
                y_cm = x_cm;
            }
        }

        collapse_masks[i] = [x_cm as u8, y_cm as u8];
        balance += pulses[i] + tell;

        // Only fold from bands that got at least one bit per bin
        update_lowband = b > (n as i32) << BITRES;
    }

    log::trace!("quant_all_bands: bands {start}..{end} balance={balance}");

    *seed = ctx.seed;
    collapse_masks
}

/// Injects noise into the short blocks of transient frames that received no
/// pulses, at a level derived from the band's depth and its energy history.
///
/// `spectrum` holds `channels` consecutive runs of normalized bins.
pub fn anti_collapse(
    spectrum: &mut [i16],
    channels: usize,
    collapse_masks: &CollapseMasks,
    lm: u8,
    start: usize,
    end: usize,
    energy: &EnergyState,
    pulses: &[i32; NUM_BANDS],
    seed: u32,
) {
    let size = spectrum.len() / channels;
    let mut seed = seed;

    for i in start..end {
        let n0 = EBANDS[i + 1] - EBANDS[i];
        let width = (n0 << lm) as i32;
        // Depth in 1/8 bits per bin
        let depth = (1 + pulses[i]) / width;
        let thresh32 = celt_exp2(-extract16(depth << (10 - BITRES))) >> 1;
        let thresh = mult16_32_q15(16384, thresh32.min(32767));

        let shift = celt_ilog2(width) >> 1;
        let sqrt_1 = celt_rsqrt_norm(width << ((7 - shift) << 1));

        for c in 0..channels {
            let mut prev1 = energy.old_log_e[c][i];
            let mut prev2 = energy.old_log_e2[c][i];
            if channels == 1 {
                prev1 = prev1.max(energy.old_log_e[1][i]);
                prev2 = prev2.max(energy.old_log_e2[1][i]);
            }
            let ediff = 0.max(energy.old_band_e[c][i] - prev1.min(prev2));

            let mut r = if ediff < 16384 {
                let r32 = celt_exp2(-extract16(ediff)) >> 1;
                2 * r32.min(16383)
            } else {
                0
            };
            if lm == 3 {
                r = mult16_16_q14(23170, r.min(23169));
            }
            r = thresh.min(r) >> 1;
            r = mult16_16_q15(sqrt_1, r) >> shift;

            let offset = c * size;
            let band = &mut spectrum[offset + (EBANDS[i] << lm)..offset + (EBANDS[i + 1] << lm)];
            let mut renormalize = false;
            for k in 0..1_usize << lm {
                if collapse_masks[i][c] & (1 << k) == 0 {
                    for j in 0..n0 {
                        seed = celt_lcg_rand(seed);
                        band[(j << lm) + k] = if seed & 0x8000 == 0 { -r } else { r } as i16;
                    }
                    renormalize = true;
                }
            }
            if renormalize {
                vq::renormalize(band, Q15ONE);
            }
        }
    }
}

/// Linear amplitude of each band of one channel of MDCT bins.
#[must_use]
pub fn compute_band_energies(freq: &[i32], lm: u8, end: usize) -> [i32; NUM_BANDS] {
    let mut band_e = [1; NUM_BANDS];
    for (i, e) in band_e.iter_mut().enumerate().take(end) {
        let band = &freq[EBANDS[i] << lm..EBANDS[i + 1] << lm];
        let maxval = band.iter().map(|v| v.saturating_abs()).max().unwrap_or(0);
        if maxval > 0 {
            let shift = celt_ilog2(maxval) - 10;
            let sum = band.iter().fold(0_i32, |sum, &v| {
                let t = extract16(vshr32(v, shift));
                sum + mult16_16(t, t)
            });
            *e = 1 + vshr32(celt_sqrt(sum), -shift);
        }
    }
    band_e
}

/// Divides each band of `freq` by its amplitude, producing unit-norm Q14
/// shapes in `x`.
pub fn normalise_bands(freq: &[i32], x: &mut [i16], band_e: &[i32; NUM_BANDS], lm: u8, end: usize) {
    for (i, &e) in band_e.iter().enumerate().take(end) {
        let shift = celt_zlog2(e) - 13;
        let e = extract16(vshr32(e, shift));
        let g = extract16(celt_rcp(e << 3));
        for j in EBANDS[i] << lm..EBANDS[i + 1] << lm {
            x[j] = mult16_16_q15(vshr32(freq[j], shift - 1), g) as i16;
        }
    }
}

/// Scales unit-norm shapes back up by the Q10 log energies of bands
/// `start..end`; every other bin is zeroed.
pub fn denormalise_bands(
    x: &[i16],
    freq: &mut [i32],
    band_log_e: &[i32; NUM_BANDS],
    start: usize,
    end: usize,
    lm: u8,
) {
    freq[..EBANDS[start] << lm].fill(0);
    for i in start..end {
        let lg = add16(band_log_e[i], i32::from(E_MEANS[i]) << 6);
        let mut shift = 16 - (lg >> DB_SHIFT);
        let mut g = 0;
        if shift > 31 {
            shift = 0;
        } else {
            g = celt_exp2_frac(lg & ((1 << DB_SHIFT) - 1));
        }
        // Handles large gains without overflowing
        if shift < -2 {
            g = 32767;
            shift = -2;
        }

        let bins = EBANDS[i] << lm..EBANDS[i + 1] << lm;
        for (f, &v) in freq[bins.clone()].iter_mut().zip(&x[bins]) {
            let scaled = mult16_16(i32::from(v), g);
            *f = if shift < 0 {
                scaled << -shift
            } else {
                scaled >> shift
            };
        }
    }
    freq[EBANDS[end] << lm..].fill(0);
}
