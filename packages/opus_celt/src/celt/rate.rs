//! Bit allocation (RFC 6716 Section 4.3.3).
//!
//! The allocator splits the frame budget between fine energy and PVQ shapes.
//! It interpolates between the static allocation vectors, honours per-band
//! caps derived from the pulse cache, and codes the band skip, intensity and
//! dual stereo decisions as it goes.
//!
//! Reference: <https://gitlab.xiph.org/xiph/opus/-/blob/34bba701ae97c913de719b1f7c10686f62cddb15/celt/rate.c>

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use std::sync::LazyLock;

use crate::range::{BITRES, Coder};

use super::constants::{
    ALLOC_VECTORS, BAND_ALLOCATION, EBANDS, LOG_N, LOG2_FRAC_TABLE, MAX_LM, NUM_BANDS,
};
use super::cwrs::pvq_v;

/// Most fine energy bits a band can receive.
pub const MAX_FINE_BITS: i32 = 8;
const FINE_OFFSET: i32 = 21;
pub(crate) const QTHETA_OFFSET: i32 = 4;
pub(crate) const QTHETA_OFFSET_TWOPHASE: i32 = 16;

const ALLOC_STEPS: i32 = 6;
const MAX_PSEUDO: usize = 40;
const LOG_MAX_PSEUDO: usize = 6;

/// Rows of the pulse cache index: split depths `LM = -1..=MAX_LM`.
const CACHE_ROWS: usize = MAX_LM as usize + 2;

const MAX_N: [i32; 15] = [
    32767, 32767, 32767, 1476, 283, 109, 60, 40, 29, 24, 20, 18, 16, 14, 13,
];
const MAX_K: [i32; 15] = [
    32767, 32767, 32767, 32767, 1172, 238, 95, 53, 36, 27, 22, 18, 16, 15, 13,
];

/// Whether the `(n, k)` codebook size fits in 32 bits.
pub(crate) fn fits_in32(n: usize, k: usize) -> bool {
    if n >= 14 {
        k < 14 && n as i32 <= MAX_N[k]
    } else {
        k as i32 <= MAX_K[n]
    }
}

/// Pulse count of pseudo-pulse level `i`: linear up to 8, then four steps
/// per octave.
#[must_use]
pub const fn get_pulses(i: usize) -> usize {
    if i < 8 {
        i
    } else {
        (8 + (i & 7)) << ((i >> 3) - 1)
    }
}

/// `log2(val)` rounded up, with `frac` fractional bits.
fn log2_frac(val: u32, frac: u32) -> i32 {
    let mut l = 32 - val.leading_zeros() as i32;
    if val & val.wrapping_sub(1) == 0 {
        // Exact powers of two need no rounding
        return (l - 1) << frac;
    }

    let mut val = if l > 16 {
        ((val - 1) >> (l - 16)) + 1
    } else {
        val << (16 - l)
    };
    l = (l - 1) << frac;
    let mut frac = frac as i32;
    loop {
        let b = (val >> 16) as i32;
        l += b << frac;
        val = (val + b as u32) >> b;
        val = val.wrapping_mul(val).wrapping_add(0x7FFF) >> 15;
        if frac <= 0 {
            break;
        }
        frac -= 1;
    }
    l + i32::from(val > 0x8000)
}

/// Bit costs of every PVQ codebook the band quantizer can reach, plus the
/// per-band rate caps derived from them.
struct PulseCache {
    /// Offset into `bits` by `(LM + 1, band)`; `-1` for empty bands.
    index: [i16; CACHE_ROWS * NUM_BANDS],
    /// Per unique size: the number of pseudo-pulse levels, then the cost in
    /// 1/8 bits (minus one) of each level.
    bits: Vec<u8>,
    /// Highest useful rate per `(LM, channels, band)`, biased by -64.
    caps: [u8; (MAX_LM as usize + 1) * 2 * NUM_BANDS],
}

static PULSE_CACHE: LazyLock<PulseCache> = LazyLock::new(PulseCache::new);

impl PulseCache {
    fn new() -> Self {
        let (index, bits) = Self::build_bits();
        let caps = Self::build_caps(&index, &bits);
        log::debug!("pulse cache built: {} entries", bits.len());
        Self { index, bits, caps }
    }

    fn build_bits() -> ([i16; CACHE_ROWS * NUM_BANDS], Vec<u8>) {
        let mut index = [-1_i16; CACHE_ROWS * NUM_BANDS];
        let mut entries: Vec<(usize, usize, usize)> = Vec::new();
        let mut curr = 0;
        let size_at = |row: usize, band: usize| ((EBANDS[band + 1] - EBANDS[band]) << row) >> 1;

        for row in 0..CACHE_ROWS {
            for band in 0..NUM_BANDS {
                let n = size_at(row, band);
                let shared = (0..=row).find_map(|prev_row| {
                    let bands = if prev_row == row { band } else { NUM_BANDS };
                    (0..bands)
                        .find(|&prev| size_at(prev_row, prev) == n)
                        .map(|prev| index[prev_row * NUM_BANDS + prev])
                });
                if let Some(offset) = shared {
                    index[row * NUM_BANDS + band] = offset;
                }
                if index[row * NUM_BANDS + band] == -1 && n != 0 {
                    let mut k = 0;
                    while k < MAX_PSEUDO && fits_in32(n, get_pulses(k + 1)) {
                        k += 1;
                    }
                    entries.push((n, k, curr));
                    index[row * NUM_BANDS + band] = curr as i16;
                    curr += k + 1;
                }
            }
        }

        let mut bits = vec![0_u8; curr];
        for (n, levels, offset) in entries {
            bits[offset] = levels as u8;
            for level in 1..=levels {
                let cost = log2_frac(pvq_v(n, get_pulses(level)), BITRES);
                bits[offset + level] = (cost - 1) as u8;
            }
        }

        (index, bits)
    }

    fn build_caps(
        index: &[i16; CACHE_ROWS * NUM_BANDS],
        bits: &[u8],
    ) -> [u8; (MAX_LM as usize + 1) * 2 * NUM_BANDS] {
        let mut caps = [0_u8; (MAX_LM as usize + 1) * 2 * NUM_BANDS];
        let mut out = 0;

        for lm in 0..=i32::from(MAX_LM) {
            for c in 1..=2_i32 {
                for band in 0..NUM_BANDS {
                    let width = (EBANDS[band + 1] - EBANDS[band]) as i32;
                    let max_bits = if width << lm == 1 {
                        (c * (1 + MAX_FINE_BITS)) << BITRES
                    } else {
                        Self::band_max_bits(index, bits, band, width, lm, c)
                    };
                    caps[out] = ((4 * max_bits / (c * (width << lm))) - 64) as u8;
                    out += 1;
                }
            }
        }

        caps
    }

    /// Cost of a fully split band at the highest rate the quantizer can
    /// use: the deepest PVQ, every split angle and the fine energy bits.
    fn band_max_bits(
        index: &[i16; CACHE_ROWS * NUM_BANDS],
        bits: &[u8],
        band: usize,
        width: i32,
        lm: i32,
        c: i32,
    ) -> i32 {
        let mut n0 = width;
        let mut lm0 = 0;
        if n0 > 2 {
            n0 >>= 1;
            lm0 -= 1;
        } else if n0 <= 1 {
            lm0 = lm.min(1);
            n0 <<= lm0;
        }

        let offset = index[(lm0 + 1) as usize * NUM_BANDS + band] as usize;
        let levels = bits[offset] as usize;
        let mut max_bits = i32::from(bits[offset + levels]) + 1;

        let mut n = n0;
        for k in 0..lm - lm0 {
            max_bits <<= 1;
            let offset = ((LOG_N[band] + ((lm0 + k) << BITRES)) >> 1) - QTHETA_OFFSET;
            // Average theta cost is 459/512 of qb
            let num = 459 * ((2 * n - 1) * offset + max_bits);
            let den = ((2 * n - 1) << 9) - 459;
            max_bits += ((num + (den >> 1)) / den).min(57);
            n <<= 1;
        }

        if c == 2 {
            max_bits <<= 1;
            let two_phase = n == 2;
            let offset = ((LOG_N[band] + (lm << BITRES)) >> 1)
                - if two_phase {
                    QTHETA_OFFSET_TWOPHASE
                } else {
                    QTHETA_OFFSET
                };
            let ndof = 2 * n - 1 - i32::from(two_phase);
            let scale = if two_phase { 512 } else { 487 };
            let num = scale * (max_bits + ndof * offset);
            let den = (ndof << 9) - scale;
            max_bits += ((num + (den >> 1)) / den).min(if two_phase { 64 } else { 61 });
        }

        let ndof = c * n + i32::from(c == 2 && n > 2);
        let mut offset = ((LOG_N[band] + (lm << BITRES)) >> 1) - FINE_OFFSET;
        if n == 2 {
            offset += (1 << BITRES) >> 2;
        }
        let num = max_bits + ndof * offset;
        let den = (ndof - 1) << BITRES;
        let qb = ((num + (den >> 1)) / den).min(MAX_FINE_BITS);

        max_bits + ((c * qb) << BITRES)
    }

    /// Cost table of `band` split down to depth `lm` (which may be `-1`).
    fn band_costs(&self, band: usize, lm: i32) -> &[u8] {
        let offset = self.index[(lm + 1) as usize * NUM_BANDS + band];
        debug_assert!(offset >= 0, "band {band} has no PVQ at LM {lm}");
        &self.bits[offset as usize..]
    }
}

/// Cost in 1/8 bits of the largest codebook of `band` at depth `lm`.
pub(crate) fn max_pulse_bits(band: usize, lm: i32) -> i32 {
    let cache = PULSE_CACHE.band_costs(band, lm);
    i32::from(cache[usize::from(cache[0])])
}

/// Largest pulse level of `band` at split depth `lm` whose cost is closest
/// to `bits` (1/8 bit).
#[must_use]
pub fn bits2pulses(band: usize, lm: i32, bits: i32) -> i32 {
    let cache = PULSE_CACHE.band_costs(band, lm);
    let bits = bits - 1;
    let mut lo = 0;
    let mut hi = usize::from(cache[0]);
    for _ in 0..LOG_MAX_PSEUDO {
        let mid = (lo + hi + 1) >> 1;
        if i32::from(cache[mid]) >= bits {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    let lo_cost = if lo == 0 { -1 } else { i32::from(cache[lo]) };
    if bits - lo_cost <= i32::from(cache[hi]) - bits {
        lo as i32
    } else {
        hi as i32
    }
}

/// Cost in 1/8 bits of pulse level `pulses` for `band` at depth `lm`.
#[must_use]
pub fn pulses2bits(band: usize, lm: i32, pulses: i32) -> i32 {
    if pulses == 0 {
        return 0;
    }
    i32::from(PULSE_CACHE.band_costs(band, lm)[pulses as usize]) + 1
}

/// Per-band allocation ceilings in 1/8 bits.
#[must_use]
pub fn init_caps(lm: u8, channels: usize) -> [i32; NUM_BANDS] {
    let row = NUM_BANDS * (2 * usize::from(lm) + channels - 1);
    std::array::from_fn(|band| {
        let n = ((EBANDS[band + 1] - EBANDS[band]) << lm) as i32;
        ((i32::from(PULSE_CACHE.caps[row + band]) + 64) * channels as i32 * n) >> 2
    })
}

#[cfg(test)]
fn cache_caps(lm: u8, channels: usize) -> &'static [u8] {
    let row = NUM_BANDS * (2 * usize::from(lm) + channels - 1);
    &PULSE_CACHE.caps[row..row + NUM_BANDS]
}

/// Inputs of [`compute_allocation`].
///
/// The `intensity` and `dual_stereo` fields are the encoder's wishes; the
/// decoder reads the coded values instead.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest<'a> {
    pub start: usize,
    pub end: usize,
    pub lm: u8,
    pub channels: usize,
    /// Dynamic allocation boosts in 1/8 bits.
    pub offsets: &'a [i32; NUM_BANDS],
    pub caps: &'a [i32; NUM_BANDS],
    pub alloc_trim: i32,
    /// Budget in 1/8 bits.
    pub total: i32,
    pub intensity: usize,
    pub dual_stereo: bool,
    /// Coded bands of the previous frame, for skip hysteresis.
    pub prev_coded_bands: usize,
    pub signal_bandwidth: usize,
}

/// Result of [`compute_allocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// PVQ budget per band in 1/8 bits.
    pub pulses: [i32; NUM_BANDS],
    /// Fine energy bits per band and channel.
    pub fine_quant: [i32; NUM_BANDS],
    /// Bands first in line for leftover bits in the final energy pass.
    pub fine_priority: [bool; NUM_BANDS],
    /// One past the last band that receives PVQ bits.
    pub coded_bands: usize,
    /// Bits over the caps, handed to the band quantizer for rebalancing.
    pub balance: i32,
    pub intensity: usize,
    pub dual_stereo: bool,
}

#[inline]
const fn edge(band: usize) -> i32 {
    EBANDS[band] as i32
}

#[inline]
const fn width(band: usize) -> i32 {
    (EBANDS[band + 1] - EBANDS[band]) as i32
}

/// Splits `request.total` between fine energy and PVQ for every band, and
/// codes the skip, intensity and dual stereo decisions.
///
/// The encoder and the decoder reach the same [`Allocation`] from the same
/// request as long as they share the coder state.
pub fn compute_allocation(request: &AllocationRequest<'_>, coder: &mut Coder<'_>) -> Allocation {
    let AllocationRequest {
        start,
        end,
        lm,
        channels,
        offsets,
        caps,
        alloc_trim,
        ..
    } = *request;
    let c = channels as i32;

    let mut total = request.total.max(0);
    let skip_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
    total -= skip_rsv;

    let mut intensity_rsv = 0;
    let mut dual_stereo_rsv = 0;
    if channels == 2 {
        intensity_rsv = i32::from(LOG2_FRAC_TABLE[end - start]);
        if intensity_rsv > total {
            intensity_rsv = 0;
        } else {
            total -= intensity_rsv;
            dual_stereo_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
            total -= dual_stereo_rsv;
        }
    }

    let mut thresh = [0; NUM_BANDS];
    let mut trim_offset = [0; NUM_BANDS];
    for j in start..end {
        let n = width(j);
        // Below this we are sure not to allocate any PVQ bits
        thresh[j] = (c << BITRES).max(((3 * n) << lm << BITRES) >> 4);
        trim_offset[j] = (c
            * n
            * (alloc_trim - 5 - i32::from(lm))
            * (end - j - 1) as i32
            * (1 << (u32::from(lm) + BITRES)))
            >> 6;
        if n << lm == 1 {
            trim_offset[j] -= c << BITRES;
        }
    }

    let trimmed = |bits: i32, j: usize| {
        if bits > 0 {
            (bits + trim_offset[j]).max(0)
        } else {
            bits
        }
    };
    let vector_bits = |row: usize, j: usize| {
        trimmed(((c * width(j) * i32::from(BAND_ALLOCATION[row][j])) << lm) >> 2, j)
    };

    // Highest allocation vector that fits
    let mut lo = 1;
    let mut hi = ALLOC_VECTORS - 1;
    while lo <= hi {
        let mid = (lo + hi) >> 1;
        let mut done = false;
        let mut psum = 0;
        for j in (start..end).rev() {
            let bits = vector_bits(mid, j) + offsets[j];
            if bits >= thresh[j] || done {
                done = true;
                psum += bits.min(caps[j]);
            } else if bits >= c << BITRES {
                psum += c << BITRES;
            }
        }
        if psum > total {
            hi = mid - 1;
        } else {
            lo = mid + 1;
        }
    }
    let hi = lo;
    let lo = lo - 1;

    let mut skip_start = start;
    let mut bits1 = [0; NUM_BANDS];
    let mut bits2 = [0; NUM_BANDS];
    for j in start..end {
        let mut low = vector_bits(lo, j);
        // Past the last vector the caps are the upper bound, trimmed the same way
        let mut high = if hi >= ALLOC_VECTORS {
            trimmed(caps[j], j)
        } else {
            vector_bits(hi, j)
        };
        if lo > 0 {
            low += offsets[j];
        }
        high += offsets[j];
        if offsets[j] > 0 {
            skip_start = j;
        }
        bits1[j] = low;
        bits2[j] = (high - low).max(0);
    }

    let interp = Interpolation {
        request,
        skip_start,
        bits1: &bits1,
        bits2: &bits2,
        thresh: &thresh,
        total,
        skip_rsv,
        intensity_rsv,
        dual_stereo_rsv,
    };
    let allocation = interp.run(coder);

    log::trace!(
        "allocation: vectors {lo}..{hi} coded_bands={} balance={} intensity={} dual_stereo={}",
        allocation.coded_bands,
        allocation.balance,
        allocation.intensity,
        allocation.dual_stereo
    );

    allocation
}

/// Second stage of the allocator: interpolation between two allocation
/// vectors, band skipping and the fine energy split.
struct Interpolation<'r, 'a> {
    request: &'r AllocationRequest<'a>,
    skip_start: usize,
    bits1: &'r [i32; NUM_BANDS],
    bits2: &'r [i32; NUM_BANDS],
    thresh: &'r [i32; NUM_BANDS],
    total: i32,
    skip_rsv: i32,
    intensity_rsv: i32,
    dual_stereo_rsv: i32,
}

impl Interpolation<'_, '_> {
    fn interpolated(&self, j: usize, step: i32) -> i32 {
        self.bits1[j] + ((step * self.bits2[j]) >> ALLOC_STEPS)
    }

    #[allow(clippy::too_many_lines)]
    fn run(self, coder: &mut Coder<'_>) -> Allocation {
        let AllocationRequest {
            start,
            end,
            lm,
            channels,
            caps,
            ..
        } = *self.request;
        let c = channels as i32;
        let stereo = u32::from(channels > 1);
        let alloc_floor = c << BITRES;
        let log_m = i32::from(lm) << BITRES;
        let mut total = self.total;
        let mut intensity_rsv = self.intensity_rsv;
        let mut dual_stereo_rsv = self.dual_stereo_rsv;

        let mut lo = 0;
        let mut hi = 1 << ALLOC_STEPS;
        for _ in 0..ALLOC_STEPS {
            let mid = (lo + hi) >> 1;
            let mut psum = 0;
            let mut done = false;
            for j in (start..end).rev() {
                let tmp = self.interpolated(j, mid);
                if tmp >= self.thresh[j] || done {
                    done = true;
                    psum += tmp.min(caps[j]);
                } else if tmp >= alloc_floor {
                    psum += alloc_floor;
                }
            }
            if psum > total {
                hi = mid;
            } else {
                lo = mid;
            }
        }

        let mut bits = [0; NUM_BANDS];
        let mut psum = 0;
        let mut done = false;
        for j in (start..end).rev() {
            let mut tmp = self.interpolated(j, lo);
            if tmp < self.thresh[j] && !done {
                tmp = if tmp >= alloc_floor { alloc_floor } else { 0 };
            } else {
                done = true;
            }
            tmp = tmp.min(caps[j]);
            bits[j] = tmp;
            psum += tmp;
        }

        // Skip bands from the top down
        let mut coded_bands = end;
        loop {
            let j = coded_bands - 1;
            // The first band and boosted bands are never skipped
            if j <= self.skip_start {
                total += self.skip_rsv;
                break;
            }

            let span = edge(coded_bands) - edge(start);
            let mut left = total - psum;
            let percoeff = left / span;
            left -= span * percoeff;
            let rem = (left - (edge(j) - edge(start))).max(0);
            let band_width = edge(coded_bands) - edge(j);
            let mut band_bits = bits[j] + percoeff * band_width + rem;

            // Below this the band is skipped without signalling
            if band_bits >= self.thresh[j].max(alloc_floor + (1 << BITRES)) {
                let hysteresis = if j < self.request.prev_coded_bands {
                    7
                } else {
                    9
                };
                let keep = coder.is_encoder()
                    && (coded_bands <= start + 2
                        || (band_bits > ((hysteresis * band_width) << lm << BITRES) >> 4
                            && j <= self.request.signal_bandwidth));
                if coder.code_bit_logp(keep, 1) {
                    break;
                }
                psum += 1 << BITRES;
                band_bits -= 1 << BITRES;
            }

            psum -= bits[j] + intensity_rsv;
            if intensity_rsv > 0 {
                intensity_rsv = i32::from(LOG2_FRAC_TABLE[j - start]);
            }
            psum += intensity_rsv;
            if band_bits >= alloc_floor {
                // Enough for a fine energy bit per channel
                psum += alloc_floor;
                bits[j] = alloc_floor;
            } else {
                bits[j] = 0;
            }
            coded_bands -= 1;
        }

        let mut intensity = 0;
        if intensity_rsv > 0 {
            let wish = self.request.intensity.clamp(start, coded_bands);
            let ft = (coded_bands + 1 - start) as u32;
            intensity = start + coder.code_uint((wish - start) as u32, ft) as usize;
        }
        if intensity <= start {
            total += dual_stereo_rsv;
            dual_stereo_rsv = 0;
        }
        let dual_stereo = dual_stereo_rsv > 0 && coder.code_bit_logp(self.request.dual_stereo, 1);

        // Spread what is left evenly over the coded bins
        let span = edge(coded_bands) - edge(start);
        let mut left = total - psum;
        let percoeff = left / span;
        left -= span * percoeff;
        for j in start..coded_bands {
            bits[j] += percoeff * width(j);
        }
        for j in start..coded_bands {
            let tmp = left.min(width(j));
            bits[j] += tmp;
            left -= tmp;
        }

        let mut fine_quant = [0; NUM_BANDS];
        let mut fine_priority = [false; NUM_BANDS];
        let mut balance = 0;
        for j in start..coded_bands {
            let n = width(j) << lm;
            let bit = bits[j] + balance;
            let mut excess;

            if n > 1 {
                excess = (bit - caps[j]).max(0);
                bits[j] = bit - excess;

                // One more degree of freedom for mid/side stereo
                let den = c * n + i32::from(channels == 2 && n > 2 && !dual_stereo && j < intensity);
                let nc_log_n = den * (LOG_N[j] + log_m);
                let mut offset = (nc_log_n >> 1) - den * FINE_OFFSET;
                if n == 2 {
                    offset += (den << BITRES) >> 2;
                }
                if bits[j] + offset < (den * 2) << BITRES {
                    offset += nc_log_n >> 2;
                } else if bits[j] + offset < (den * 3) << BITRES {
                    offset += nc_log_n >> 3;
                }

                let mut ebits = (bits[j] + offset + (den << (BITRES - 1))).max(0);
                ebits = (ebits / den) >> BITRES;
                if c * ebits > (bits[j] >> BITRES) {
                    ebits = bits[j] >> stereo >> BITRES;
                }
                ebits = ebits.min(MAX_FINE_BITS);

                // Rounded down or capped
                fine_priority[j] = ebits * (den << BITRES) >= bits[j] + offset;
                bits[j] -= (c * ebits) << BITRES;
                fine_quant[j] = ebits;
            } else {
                // A single sign bit, the rest goes to fine energy
                excess = (bit - (c << BITRES)).max(0);
                bits[j] = bit - excess;
                fine_quant[j] = 0;
                fine_priority[j] = true;
            }

            if excess > 0 {
                let extra_fine = (excess >> (stereo + BITRES)).min(MAX_FINE_BITS - fine_quant[j]);
                fine_quant[j] += extra_fine;
                let extra_bits = (extra_fine * c) << BITRES;
                fine_priority[j] = extra_bits >= excess - balance;
                excess -= extra_bits;
            }
            balance = excess;
        }

        // Skipped bands spend their floor on fine energy
        for j in coded_bands..end {
            fine_quant[j] = bits[j] >> stereo >> BITRES;
            bits[j] = 0;
            fine_priority[j] = fine_quant[j] < 1;
        }

        Allocation {
            pulses: bits,
            fine_quant,
            fine_priority,
            coded_bands,
            balance,
            intensity,
            dual_stereo,
        }
    }
}
