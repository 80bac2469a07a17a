/// Integer log base 2 as used by the range coder (`EC_ILOG`).
///
/// Returns the number of bits needed to represent `x`, so `ilog(0) == 0`,
/// `ilog(1) == 1` and `ilog(255) == 8`.
#[must_use]
pub const fn ilog(x: u32) -> u32 {
    if x == 0 { 0 } else { 32 - x.leading_zeros() }
}
