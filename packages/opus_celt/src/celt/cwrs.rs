//! Combinatorial indexing of PVQ codewords (RFC 6716 Section 4.3.4.2).
//!
//! A codeword is an integer vector of `n` entries whose absolute values sum
//! to `k`. Codewords are enumerated through `U(n, k)`, the number of such
//! vectors whose last entry is non-negative and non-zero (plus all-zero when
//! `k == 0`), giving a codebook of `V(n, k) = U(n, k) + U(n, k + 1)` entries.
//!
//! Reference: <https://gitlab.xiph.org/xiph/opus/-/blob/34bba701ae97c913de719b1f7c10686f62cddb15/celt/cwrs.c>

#![allow(clippy::cast_possible_truncation)]

use crate::range::{RangeDecoder, RangeEncoder};

const U_ROWS: usize = 15;
const U_COLS: usize = 177;

/// `U(min(n, k), max(n, k))`, built from
/// `U(n, k) = U(n - 1, k) + U(n, k - 1) + U(n - 1, k - 1)`.
///
/// Entries that do not fit in 32 bits wrap. They lie outside the domain
/// admitted by the allocator and are never read.
static PVQ_U: [[u32; U_COLS]; U_ROWS] = build_u_table();

const fn build_u_table() -> [[u32; U_COLS]; U_ROWS] {
    let mut table = [[0_u32; U_COLS]; U_ROWS];
    table[0][0] = 1;

    let mut n = 1;
    while n < U_ROWS {
        let mut k = 1;
        while k < U_COLS {
            table[n][k] = table[n - 1][k]
                .wrapping_add(table[n][k - 1])
                .wrapping_add(table[n - 1][k - 1]);
            k += 1;
        }
        n += 1;
    }

    table
}

/// `U(n, k)`.
///
/// # Panics
///
/// * If `min(n, k) > 14` or `max(n, k) > 176`
#[must_use]
pub fn pvq_u(n: usize, k: usize) -> u32 {
    PVQ_U[n.min(k)][n.max(k)]
}

/// Size of the codebook of `n`-dimensional vectors with `k` pulses.
#[must_use]
pub fn pvq_v(n: usize, k: usize) -> u32 {
    pvq_u(n, k).wrapping_add(pvq_u(n, k + 1))
}

/// Index of the codeword `y` in its codebook.
///
/// Dimensions are peeled from the end; each step adds the number of
/// codewords that sort before `y` given the pulses already accounted for.
///
/// # Panics
///
/// * If `y` has fewer than two entries
#[must_use]
pub fn index_of(y: &[i32]) -> u32 {
    let n = y.len();
    assert!(n >= 2, "codewords need at least two dimensions");

    let mut j = n - 1;
    let mut index = u32::from(y[j] < 0);
    let mut k = y[j].unsigned_abs() as usize;
    loop {
        j -= 1;
        index += pvq_u(n - j, k);
        k += y[j].unsigned_abs() as usize;
        if y[j] < 0 {
            index += pvq_u(n - j, k + 1);
        }
        if j == 0 {
            break;
        }
    }

    index
}

#[inline]
fn signed_pulses(count: usize, negative: bool) -> i32 {
    let count = i32::try_from(count).unwrap_or(i32::MAX);
    if negative { -count } else { count }
}

/// Writes codeword number `index` of the `(y.len(), k)` codebook into `y` and
/// returns its squared norm.
///
/// # Panics
///
/// * If `k == 0` or `y` has fewer than two entries
pub fn vector_of(index: u32, k: usize, y: &mut [i32]) -> i32 {
    assert!(k > 0, "codewords need at least one pulse");
    assert!(y.len() >= 2, "codewords need at least two dimensions");

    let mut n = y.len();
    let mut k = k;
    let mut i = index;
    let mut yy = 0;
    let mut pos = 0;

    while n > 2 {
        let k0 = k;
        let negative;
        if k >= n {
            // Lots of pulses
            let mut p = pvq_u(n, k + 1);
            negative = i >= p;
            if negative {
                i -= p;
            }
            let q = pvq_u(n, n);
            if q > i {
                k = n;
                loop {
                    k -= 1;
                    p = pvq_u(k, n);
                    if p <= i {
                        break;
                    }
                }
            } else {
                p = pvq_u(n, k);
                while p > i {
                    k -= 1;
                    p = pvq_u(n, k);
                }
            }
            i -= p;
        } else {
            // Lots of dimensions
            let p = pvq_u(k, n);
            let q = pvq_u(k + 1, n);
            if p <= i && i < q {
                i -= p;
                y[pos] = 0;
                pos += 1;
                n -= 1;
                continue;
            }
            negative = i >= q;
            if negative {
                i -= q;
            }
            let mut p;
            loop {
                k -= 1;
                p = pvq_u(k, n);
                if p <= i {
                    break;
                }
            }
            i -= p;
        }

        let val = signed_pulses(k0 - k, negative);
        y[pos] = val;
        yy += val * val;
        pos += 1;
        n -= 1;
    }

    // n == 2
    let p = 2 * k as u32 + 1;
    let negative = i >= p;
    if negative {
        i -= p;
    }
    let k0 = k;
    k = ((i + 1) >> 1) as usize;
    if k > 0 {
        i -= 2 * k as u32 - 1;
    }
    let val = signed_pulses(k0 - k, negative);
    y[pos] = val;
    yy += val * val;

    // n == 1
    let val = signed_pulses(k, i != 0);
    y[pos + 1] = val;
    yy += val * val;

    yy
}

/// Codes the pulse vector `y` holding `k` pulses as a uniform integer.
pub fn encode_pulses(y: &[i32], k: usize, enc: &mut RangeEncoder) {
    assert!(k > 0, "cannot code an empty codeword");
    enc.ec_enc_uint(index_of(y), pvq_v(y.len(), k));
}

/// Reads a pulse vector of `k` pulses into `y` and returns its squared norm.
pub fn decode_pulses(y: &mut [i32], k: usize, dec: &mut RangeDecoder) -> i32 {
    let index = dec.ec_dec_uint(pvq_v(y.len(), k));
    vector_of(index, k, y)
}
