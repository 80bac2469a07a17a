//! Fixed-point arithmetic shared by the encoder and decoder.
//!
//! Every helper reproduces the exact truncation and rounding of the libopus
//! fixed-point macros. Values named `*16` are held in `i32` but carry `i16`
//! semantics: the result is truncated to 16 bits wherever the reference casts.
//!
//! Reference: <https://gitlab.xiph.org/xiph/opus/-/blob/34bba701ae97c913de719b1f7c10686f62cddb15/celt/mathops.h>

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use crate::util::ilog;

pub const Q15ONE: i32 = 32767;

/// Log energies are Q10 (`DB_SHIFT`).
pub const DB_SHIFT: i32 = 10;

#[inline]
pub const fn extract16(x: i32) -> i32 {
    x as i16 as i32
}

#[inline]
pub const fn add16(a: i32, b: i32) -> i32 {
    extract16(a + b)
}

#[inline]
pub const fn sub16(a: i32, b: i32) -> i32 {
    extract16(a - b)
}

#[inline]
pub const fn mult16_16(a: i32, b: i32) -> i32 {
    (a as i16 as i32) * (b as i16 as i32)
}

#[inline]
pub const fn mult16_16_q15(a: i32, b: i32) -> i32 {
    mult16_16(a, b) >> 15
}

#[inline]
pub const fn mult16_16_q14(a: i32, b: i32) -> i32 {
    mult16_16(a, b) >> 14
}

#[inline]
pub const fn mult16_16_p15(a: i32, b: i32) -> i32 {
    (16384 + mult16_16(a, b)) >> 15
}

#[inline]
pub const fn mult16_32_q15(a: i32, b: i32) -> i32 {
    (((a as i16 as i64) * (b as i64)) >> 15) as i32
}

#[inline]
pub const fn mult16_32_q16(a: i32, b: i32) -> i32 {
    (((a as i16 as i64) * (b as i64)) >> 16) as i32
}

/// 32x32 multiply keeping the top bits, computed from 16-bit partial products
/// (the low x low term is dropped, so this is not a plain `(a * b) >> 31`).
#[inline]
pub const fn mult32_32_q31(a: i32, b: i32) -> i32 {
    let ah = a >> 16;
    let bh = b >> 16;
    let al = a & 0xffff;
    let bl = b & 0xffff;
    ((ah * bh) << 1)
        .wrapping_add((ah * bl) >> 15)
        .wrapping_add((bh * al) >> 15)
}

/// Rounding right shift.
#[inline]
pub const fn pshr32(a: i32, shift: u32) -> i32 {
    (a + (1 << (shift - 1))) >> shift
}

/// Shift right by `shift`, or left when it is negative.
#[inline]
pub const fn vshr32(a: i32, shift: i32) -> i32 {
    if shift > 0 {
        a >> shift
    } else {
        a.wrapping_shl((-shift) as u32)
    }
}

#[inline]
pub const fn half32(a: i32) -> i32 {
    a >> 1
}

/// Q15 multiply with rounding and 16-bit operands (`FRAC_MUL16`).
#[inline]
pub const fn frac_mul16(a: i32, b: i32) -> i32 {
    (16384 + mult16_16(a, b)) >> 15
}

/// Floor of log2 for positive `x`.
#[inline]
pub const fn celt_ilog2(x: i32) -> i32 {
    debug_assert!(x > 0);
    ilog(x as u32) as i32 - 1
}

/// Like [`celt_ilog2`] but returns 0 for non-positive input.
#[inline]
pub const fn celt_zlog2(x: i32) -> i32 {
    if x <= 0 { 0 } else { celt_ilog2(x) }
}

/// Reciprocal of a positive Q`n` value, returned in Q`(31 - n)`.
pub const fn celt_rcp(x: i32) -> i32 {
    debug_assert!(x > 0);
    let i = celt_ilog2(x);
    let n = extract16(vshr32(x, i - 15) - 32768);
    let mut r = add16(30840, mult16_16_q15(-15420, n));
    r = sub16(
        r,
        mult16_16_q15(r, add16(mult16_16_q15(r, n), add16(r, -32768))),
    );
    r = sub16(
        r,
        add16(
            1,
            mult16_16_q15(r, add16(mult16_16_q15(r, n), add16(r, -32768))),
        ),
    );
    vshr32(r, i - 16)
}

#[inline]
pub const fn celt_div(a: i32, b: i32) -> i32 {
    mult32_32_q31(a, celt_rcp(b))
}

/// Q14 reciprocal square root of a Q16 input in `[0.25, 1)`.
pub const fn celt_rsqrt_norm(x: i32) -> i32 {
    let n = extract16(x - 32768);
    let r = add16(23557, mult16_16_q15(n, add16(-13490, mult16_16_q15(n, 6713))));
    let r2 = mult16_16_q15(r, r);
    let y = extract16(sub16(add16(mult16_16_q15(r2, n), r2), 16384) << 1);
    add16(
        r,
        mult16_16_q15(r, mult16_16_q15(y, sub16(mult16_16_q15(y, 12288), 16384))),
    )
}

/// Square root of a Q`2n` value, returned in Q`n`. Saturates at 32767.
pub const fn celt_sqrt(x: i32) -> i32 {
    const C: [i32; 5] = [23175, 11561, -3011, 1699, -664];

    if x == 0 {
        return 0;
    }
    if x >= 1_073_741_824 {
        return 32767;
    }
    let k = (celt_ilog2(x) >> 1) - 7;
    let x = vshr32(x, 2 * k);
    let n = extract16(x - 32768);
    let rt = add16(
        C[0],
        mult16_16_q15(
            n,
            add16(
                C[1],
                mult16_16_q15(
                    n,
                    add16(C[2], mult16_16_q15(n, add16(C[3], mult16_16_q15(n, C[4])))),
                ),
            ),
        ),
    );
    vshr32(rt, 7 - k)
}

const fn celt_atan01(x: i32) -> i32 {
    const M1: i32 = 32767;
    const M2: i32 = -21;
    const M3: i32 = -11943;
    const M4: i32 = 4936;

    mult16_16_p15(
        x,
        M1 + mult16_16_p15(x, M2 + mult16_16_p15(x, M3 + mult16_16_p15(M4, x))),
    )
}

/// `atan2` for non-negative inputs, Q15 in (scaled so that pi/2 is 25736).
pub const fn celt_atan2p(y: i32, x: i32) -> i32 {
    if y < x {
        let arg = celt_div(y << 15, x);
        let arg = if arg >= 32767 { 32767 } else { arg };
        extract16(celt_atan01(extract16(arg)) >> 1)
    } else {
        let arg = celt_div(x << 15, y);
        let arg = if arg >= 32767 { 32767 } else { arg };
        25736 - (celt_atan01(extract16(arg)) >> 1)
    }
}

const fn celt_cos_pi_2(x: i32) -> i32 {
    const L1: i32 = 32767;
    const L2: i32 = -7651;
    const L3: i32 = 8277;
    const L4: i32 = -626;

    let x2 = mult16_16_p15(x, x);
    let poly = add16(
        sub16(L1, x2),
        mult16_16_p15(
            x2,
            add16(L2, mult16_16_p15(x2, add16(L3, mult16_16_p15(L4, x2)))),
        ),
    );
    add16(1, if poly < 32766 { poly } else { 32766 })
}

/// Cosine of `x * pi / 2^17` for the full circle, Q15 out.
pub const fn celt_cos_norm(x: i32) -> i32 {
    let mut x = x & 0x0001_ffff;
    if x > 65536 {
        x = 131_072 - x;
    }
    if x & 0x7fff != 0 {
        if x < 32768 {
            celt_cos_pi_2(x)
        } else {
            -celt_cos_pi_2(65536 - x)
        }
    } else if x & 0xffff != 0 {
        0
    } else if x & 0x0001_ffff != 0 {
        -32767
    } else {
        32767
    }
}

/// `2^x` for a Q10 fraction in `0..1024`, Q14 out.
pub const fn celt_exp2_frac(x: i32) -> i32 {
    const D0: i32 = 16383;
    const D1: i32 = 22804;
    const D2: i32 = 14819;
    const D3: i32 = 10204;

    let frac = extract16(x << 4);
    add16(
        D0,
        mult16_16_q15(frac, add16(D1, mult16_16_q15(frac, add16(D2, mult16_16_q15(D3, frac))))),
    )
}

/// `log2(x)` in Q10 for a Q14 input; `-32767` for zero.
pub const fn celt_log2(x: i32) -> i32 {
    const C: [i32; 5] = [-6801 + (1 << (13 - DB_SHIFT)), 15746, -5217, 2545, -1401];

    if x == 0 {
        return -32767;
    }
    let i = celt_ilog2(x);
    let n = extract16(vshr32(x, i - 15) - 32768 - 16384);
    let frac = add16(
        C[0],
        mult16_16_q15(
            n,
            add16(
                C[1],
                mult16_16_q15(n, add16(C[2], mult16_16_q15(n, add16(C[3], mult16_16_q15(n, C[4]))))),
            ),
        ),
    );
    extract16(((i - 13) << DB_SHIFT) + (frac >> (14 - DB_SHIFT)))
}

/// `2^x` for a Q10 exponent, Q16 out.
pub const fn celt_exp2(x: i32) -> i32 {
    let integer = x >> 10;
    if integer > 14 {
        return 0x7f00_0000;
    }
    if integer < -15 {
        return 0;
    }
    let frac = celt_exp2_frac(extract16(x - (integer << 10)));
    vshr32(frac, -integer - 2)
}

/// Cosine approximation used for the band split angle, `x` in `(0, 16384)`.
pub const fn bitexact_cos(x: i32) -> i32 {
    let x2 = (4096 + x * x) >> 13;
    let x2 = extract16(
        (32767 - x2) + frac_mul16(x2, -7651 + frac_mul16(x2, 8277 + frac_mul16(-626, x2))),
    );
    1 + x2
}

/// `log2(isin / icos)` in Q11.
pub const fn bitexact_log2tan(isin: i32, icos: i32) -> i32 {
    let lc = ilog(icos as u32) as i32;
    let ls = ilog(isin as u32) as i32;
    let icos = icos << (15 - lc);
    let isin = isin << (15 - ls);
    (ls - lc) * (1 << 11) + frac_mul16(isin, frac_mul16(isin, -2597) + 7932)
        - frac_mul16(icos, frac_mul16(icos, -2597) + 7932)
}

/// Linear congruential generator driving folding and anti-collapse noise.
#[inline]
pub const fn celt_lcg_rand(seed: u32) -> u32 {
    seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223)
}
