use crate::error::{Error, Result};
use crate::util::ilog;

use super::{BITRES, CODE_TOP, LAPLACE_LOG_MINP, LAPLACE_MINP, UINT_BITS, laplace_freq1};

/// Range decoder for entropy decoding of CELT frames.
///
/// Implements the range decoder specified in RFC 6716 Section 4.1. The decoder
/// reads range-coded symbols from the front of the buffer and raw bits from the
/// end of the buffer.
///
/// Corrupt input never panics and never returns an error from an individual
/// call. Instead a sticky error flag is raised (for example when a uniform
/// integer decodes outside its alphabet) and the caller checks
/// [`RangeDecoder::error`] once the frame has been walked.
///
/// # Examples
///
/// ```rust
/// # use moosicbox_opus_celt::range::RangeDecoder;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let frame = vec![0x80, 0x00, 0x00, 0x00];
/// let mut decoder = RangeDecoder::new(&frame)?;
///
/// // Decode a bit with 50% probability
/// let _bit = decoder.ec_dec_bit_logp(1);
/// assert!(!decoder.error());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RangeDecoder {
    buffer: Vec<u8>,
    position: usize,
    value: u32,
    range: u32,
    total_bits: u32,
    leftover_bit: u32,
    end_position: usize,
    end_window: u32,
    end_bits_available: u32,
    error: bool,
}

impl RangeDecoder {
    /// Creates a new range decoder and initializes it per RFC 6716 Section 4.1.1.
    ///
    /// # Errors
    ///
    /// Returns an error if the input buffer is empty.
    pub fn new(data: &[u8]) -> Result<Self> {
        let Some(&b0) = data.first() else {
            return Err(Error::RangeDecoder("empty buffer".to_string()));
        };

        let mut decoder = Self {
            buffer: data.to_vec(),
            position: 1,
            value: u32::from(127 - (b0 >> 1)),
            range: 128,
            total_bits: 9,
            leftover_bit: u32::from(b0 & 1),
            end_position: 0,
            end_window: 0,
            end_bits_available: 0,
            error: false,
        };

        decoder.normalize();

        Ok(decoder)
    }

    fn normalize(&mut self) {
        while self.range <= CODE_TOP >> 8 {
            self.range <<= 8;

            let byte = self.buffer.get(self.position).copied().unwrap_or(0);
            self.position += 1;

            let sym = (self.leftover_bit << 7) | u32::from(byte >> 1);
            self.leftover_bit = u32::from(byte & 1);

            self.value = ((self.value << 8) + (255 & !sym)) & (CODE_TOP - 1);
            self.total_bits += 8;
        }
    }

    fn read_byte_from_end(&mut self) -> u8 {
        if self.end_position < self.buffer.len() {
            self.end_position += 1;
            self.buffer[self.buffer.len() - self.end_position]
        } else {
            0
        }
    }

    /// Decodes a symbol with cumulative frequency `ft` per RFC 6716 Section 4.1.2.
    ///
    /// Must be followed by [`RangeDecoder::ec_dec_update`] with the bounds of the
    /// symbol whose range contains the returned value.
    #[must_use]
    pub fn ec_decode(&self, ft: u32) -> u32 {
        let ext = self.range / ft;
        ft - (self.value / ext + 1).min(ft)
    }

    /// Decodes a binary symbol per RFC 6716 Section 4.1.3.1.
    ///
    /// Equivalent to [`RangeDecoder::ec_decode`] with `ft = 1 << ftb`.
    #[must_use]
    pub fn ec_decode_bin(&self, ftb: u32) -> u32 {
        let ext = self.range >> ftb;
        let ft = 1_u32 << ftb;
        ft - (self.value / ext + 1).min(ft)
    }

    /// Updates decoder state after decoding a symbol per RFC 6716 Section 4.1.2.
    pub fn ec_dec_update(&mut self, fl: u32, fh: u32, ft: u32) {
        let ext = self.range / ft;
        let s = ext.wrapping_mul(ft - fh);

        self.value = self.value.wrapping_sub(s);
        self.range = if fl > 0 {
            ext.wrapping_mul(fh - fl)
        } else {
            self.range.wrapping_sub(s)
        };

        self.normalize();
    }

    /// Decodes a single bit with probability `1/(1<<logp)` of being set per
    /// RFC 6716 Section 4.1.3.2.
    pub fn ec_dec_bit_logp(&mut self, logp: u32) -> bool {
        let r = self.range;
        let d = self.value;
        let s = r >> logp;
        let ret = d < s;

        if !ret {
            self.value = d - s;
        }
        self.range = if ret { s } else { r - s };

        self.normalize();

        ret
    }

    /// Decodes a symbol using an inverse CDF table per RFC 6716 Section 4.1.3.3.
    ///
    /// ICDF tables MUST be terminated with a value of 0.
    ///
    /// # Algorithm (libopus entdec.c)
    ///
    /// ```c
    /// s = _this->rng;
    /// d = _this->val;
    /// r = s >> _ftb;
    /// ret = -1;
    /// do {
    ///     t = s;
    ///     s = IMUL32(r, _icdf[++ret]);
    /// } while(d < s);
    /// ```
    pub fn ec_dec_icdf(&mut self, icdf: &[u8], ftb: u32) -> usize {
        let d = self.value;
        let r = self.range >> ftb;
        let mut s = self.range;
        let mut t;
        let mut ret = 0;

        loop {
            t = s;
            s = r * u32::from(icdf[ret]);
            if d >= s {
                break;
            }
            ret += 1;
        }

        self.value = d - s;
        self.range = t - s;
        self.normalize();

        ret
    }

    /// Extracts raw bits from the end of the frame per RFC 6716 Section 4.1.4.
    ///
    /// Reads bits backwards from the end of the buffer, independent of range coder
    /// state. Reading past the front of the buffer yields zero bits.
    ///
    /// # Panics
    ///
    /// * If `bits > 25`
    pub fn ec_dec_bits(&mut self, bits: u32) -> u32 {
        assert!(bits <= 25, "cannot decode more than 25 raw bits at once");

        if bits == 0 {
            return 0;
        }

        while self.end_bits_available < bits {
            let byte = self.read_byte_from_end();
            self.end_window |= u32::from(byte) << self.end_bits_available;
            self.end_bits_available += 8;
        }

        let result = self.end_window & ((1_u32 << bits) - 1);

        self.end_window >>= bits;
        self.end_bits_available -= bits;
        self.total_bits += bits;

        result
    }

    /// Decodes a uniformly distributed integer in range `[0, ft)` per RFC 6716
    /// Section 4.1.5.
    ///
    /// Values that decode outside the alphabet are clamped to `ft - 1` and the
    /// sticky error flag is raised.
    pub fn ec_dec_uint(&mut self, ft: u32) -> u32 {
        debug_assert!(ft > 1, "uniform alphabet must have at least two symbols");

        if ft <= 1 {
            return 0;
        }

        let max = ft - 1;
        let ftb = ilog(max);

        if ftb > UINT_BITS {
            let shift = ftb - UINT_BITS;
            let ft_high = (max >> shift) + 1;
            let s = self.ec_decode(ft_high);
            self.ec_dec_update(s, s + 1, ft_high);

            let t = (s << shift) | self.ec_dec_bits(shift);
            if t <= max {
                return t;
            }

            log::debug!("ec_dec_uint: decoded {t} outside [0, {ft})");
            self.error = true;
            max
        } else {
            let s = self.ec_decode(ft);
            self.ec_dec_update(s, s + 1, ft);
            s
        }
    }

    /// Decodes a Laplace-distributed coarse energy residual per RFC 6716
    /// Section 4.3.2.1.
    ///
    /// Reference: <https://gitlab.xiph.org/xiph/opus/-/blob/34bba701ae97c913de719b1f7c10686f62cddb15/celt/laplace.c#L101-142>
    ///
    /// # Arguments
    ///
    /// * `fs` - Probability of zero, scaled to 32768
    /// * `decay` - Decay of the geometric tail, Q14
    #[allow(clippy::cast_possible_wrap)]
    pub fn ec_laplace_decode(&mut self, fs: u32, decay: u32) -> i32 {
        let mut val = 0_i32;
        let fm = self.ec_decode_bin(15);
        let mut fl = 0_u32;
        let mut fs = fs;

        if fm >= fs {
            val += 1;
            fl = fs;
            fs = laplace_freq1(fs, decay) + LAPLACE_MINP;

            while fs > LAPLACE_MINP && fm >= fl + 2 * fs {
                fs *= 2;
                fl += fs;
                fs = ((fs - 2 * LAPLACE_MINP) * decay) >> 15;
                fs += LAPLACE_MINP;
                val += 1;
            }

            if fs <= LAPLACE_MINP {
                let di = (fm - fl) >> (LAPLACE_LOG_MINP + 1);
                val += di as i32;
                fl += 2 * di * LAPLACE_MINP;
            }

            if fm < fl + fs {
                val = -val;
            } else {
                fl += fs;
            }
        }

        self.ec_dec_update(fl, (fl + fs).min(32768), 32768);

        val
    }

    /// Returns the number of whole bits decoded so far.
    #[must_use]
    pub const fn ec_tell(&self) -> u32 {
        self.total_bits - ilog(self.range)
    }

    /// Returns the number of bits decoded so far in 1/8 bit units.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use moosicbox_opus_celt::range::RangeDecoder;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let frame = vec![0x80, 0x00, 0x00, 0x00];
    /// let decoder = RangeDecoder::new(&frame)?;
    ///
    /// let bits_frac = decoder.ec_tell_frac(); // In 1/8 bit units
    /// let bits_whole = decoder.ec_tell();
    /// assert!(bits_frac <= bits_whole * 8);
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn ec_tell_frac(&self) -> u32 {
        let mut lg = ilog(self.range);
        let mut r_q15 = self.range >> (lg - 16);

        for _ in 0..BITRES {
            r_q15 = (r_q15 * r_q15) >> 15;
            let bit = r_q15 >> 16;
            lg = (lg << 1) | bit;
            r_q15 >>= bit;
        }

        (self.total_bits << BITRES) - lg
    }

    /// Pretends every remaining bit of the frame has been consumed.
    ///
    /// Used for silence frames, where the rest of the walk must see an
    /// exhausted budget.
    pub fn skip_to_end(&mut self) {
        let storage_bits = u32::try_from(self.buffer.len() * 8).unwrap_or(u32::MAX);
        let tell = self.ec_tell();
        if storage_bits > tell {
            self.total_bits += storage_bits - tell;
        }
    }

    /// Returns the size of the frame in bytes.
    #[must_use]
    pub const fn storage(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the current range value.
    ///
    /// Once a frame has been fully decoded this is the "final range" that must
    /// match the encoder's.
    #[must_use]
    pub const fn range(&self) -> u32 {
        self.range
    }

    /// Returns `true` if corrupt input has been detected.
    #[must_use]
    pub const fn error(&self) -> bool {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_new_with_valid_buffer() {
        let data = vec![0x01, 0x02, 0x03, 0x04];
        let decoder = RangeDecoder::new(&data);
        assert!(decoder.is_ok());
    }

    #[test]
    fn test_new_with_empty_buffer() {
        let data: Vec<u8> = vec![];
        let result = RangeDecoder::new(&data);
        let Err(Error::RangeDecoder(msg)) = result else {
            panic!("Invalid response {result:?}");
        };
        assert_eq!(msg, "empty buffer");
    }

    #[test]
    fn test_initialization_normalizes_range() {
        let data = vec![0b1010_1010, 0x00, 0x00, 0x00];
        let decoder = RangeDecoder::new(&data).unwrap();
        assert!(decoder.range > CODE_TOP >> 8);
        assert_eq!(decoder.ec_tell(), 1);
    }

    #[test_case(vec![0xFF, 0x00, 0x00, 0x00, 0x00], 1, true ; "logp_1_returns_true")]
    #[test_case(vec![0xFF, 0x00, 0x00, 0x00, 0x00], 4, true ; "logp_4_returns_true")]
    #[test_case(vec![0x00, 0xFF, 0xFF, 0xFF, 0xFF], 1, false ; "logp_1_returns_false")]
    #[test_case(vec![0x00, 0xFF, 0xFF, 0xFF, 0xFF], 4, false ; "logp_4_returns_false")]
    #[allow(clippy::needless_pass_by_value)]
    fn test_ec_dec_bit_logp_with_various_inputs(data: Vec<u8>, logp: u32, expected: bool) {
        let mut decoder = RangeDecoder::new(&data).unwrap();
        assert_eq!(decoder.ec_dec_bit_logp(logp), expected);
    }

    #[test]
    fn test_ec_dec_icdf_last_symbol_for_low_input() {
        let data = vec![0x00, 0x00, 0x00, 0x00];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        let icdf = [200, 150, 100, 50, 0];
        assert_eq!(decoder.ec_dec_icdf(&icdf, 8), 0);
    }

    #[test]
    fn test_ec_dec_bits_backward_reading() {
        let data = vec![0x00, 0x00, 0x00, 0xAA];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        assert_eq!(decoder.ec_dec_bits(8), 0xAA);
    }

    #[test]
    fn test_ec_dec_bits_lsb_first_within_byte() {
        let data = vec![0x00, 0x00, 0x00, 0b1010_1010];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        assert_eq!(decoder.ec_dec_bits(1), 0);
        assert_eq!(decoder.ec_dec_bits(1), 1);
        assert_eq!(decoder.ec_dec_bits(1), 0);
        assert_eq!(decoder.ec_dec_bits(1), 1);
    }

    #[test]
    fn test_ec_dec_bits_multi_byte_backward() {
        let data = vec![0x00, 0x00, 0x12, 0x34];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        assert_eq!(decoder.ec_dec_bits(16), 0x1234);
    }

    #[test]
    fn test_ec_dec_bits_counts_towards_tell() {
        let data = vec![0x00, 0x00, 0x12, 0x34];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        let before = decoder.ec_tell();
        let _ = decoder.ec_dec_bits(5);
        assert_eq!(decoder.ec_tell(), before + 5);
    }

    #[test]
    fn test_read_beyond_buffer_returns_zero() {
        let data = vec![0xFF];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        assert_eq!(decoder.ec_dec_bits(8), 0xFF);
        assert_eq!(decoder.ec_dec_bits(8), 0x00);
    }

    #[test]
    fn test_ec_dec_uint_overflow_clamps_and_sets_error() {
        // The range coded high part lands on its last bucket and the raw low
        // bit is set, which decodes to 257 for a 257 symbol alphabet.
        let data = vec![0xFF, 0x00, 0x00, 0xFF];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        assert_eq!(decoder.ec_dec_uint(257), 256);
        assert!(decoder.error());
    }

    #[test]
    fn test_ec_tell_frac_matches_whole_bits() {
        let data = vec![0xAA, 0x55, 0xFF, 0x00, 0x12, 0x34, 0x56, 0x78];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        for _ in 0..10 {
            let _ = decoder.ec_dec_bit_logp(3);
            let whole = decoder.ec_tell();
            let frac = decoder.ec_tell_frac();
            assert!(frac <= whole * 8);
            assert!(frac > (whole - 1) * 8);
        }
    }

    #[test]
    fn test_skip_to_end_exhausts_budget() {
        let data = vec![0xAA, 0x55, 0xFF, 0x00];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        decoder.skip_to_end();
        assert_eq!(decoder.ec_tell(), 32);
    }

    #[test]
    fn test_laplace_decode_zero_for_low_frequency() {
        let data = vec![0x00; 8];
        let mut decoder = RangeDecoder::new(&data).unwrap();

        // A small decoded frequency falls into the zero bucket
        assert_eq!(decoder.ec_laplace_decode(16384, 6000), 0);
    }
}
