//! Range coder (RFC 6716 Section 4.1).
//!
//! The same frame buffer is shared by two streams: range-coded symbols grow
//! forward from the start, raw bits grow backward from the end.

mod decoder;
mod encoder;

pub use decoder::RangeDecoder;
pub use encoder::RangeEncoder;

/// Fractional bit resolution used by `tell_frac` (1/8 bit).
pub const BITRES: u32 = 3;

pub(crate) const CODE_BITS: u32 = 32;
pub(crate) const SYM_BITS: u32 = 8;
pub(crate) const SYM_MAX: u32 = (1 << SYM_BITS) - 1;
pub(crate) const CODE_TOP: u32 = 1 << (CODE_BITS - 1);
pub(crate) const CODE_SHIFT: u32 = CODE_BITS - SYM_BITS - 1;
pub(crate) const UINT_BITS: u32 = 8;
pub(crate) const WINDOW_SIZE: u32 = 32;

pub(crate) const LAPLACE_LOG_MINP: u32 = 0;
pub(crate) const LAPLACE_MINP: u32 = 1 << LAPLACE_LOG_MINP;
/// Minimum number of guaranteed representable energy values in each direction.
pub(crate) const LAPLACE_NMIN: u32 = 16;

/// Probability of a residual of magnitude one, given the probability of zero.
pub(crate) const fn laplace_freq1(fs0: u32, decay: u32) -> u32 {
    let ft = 32768 - LAPLACE_MINP * (2 * LAPLACE_NMIN) - fs0;
    (ft * (16384 - decay)) >> 15
}

/// Either side of the range coder.
///
/// The band walk, the allocator and the frame parameter walk are written once
/// and run against this: the encoder writes the value it is given and returns
/// it, the decoder ignores the value and returns what it read.
#[derive(Debug)]
pub enum Coder<'a> {
    Encoder(&'a mut RangeEncoder),
    Decoder(&'a mut RangeDecoder),
}

impl Coder<'_> {
    #[must_use]
    pub const fn is_encoder(&self) -> bool {
        matches!(self, Self::Encoder(_))
    }

    /// Whole bits used so far.
    #[must_use]
    pub fn tell(&self) -> i32 {
        let bits = match self {
            Self::Encoder(enc) => enc.ec_tell(),
            Self::Decoder(dec) => dec.ec_tell(),
        };
        i32::try_from(bits).unwrap_or(i32::MAX)
    }

    /// Bits used so far in 1/8 bit units.
    #[must_use]
    pub fn tell_frac(&self) -> i32 {
        let bits = match self {
            Self::Encoder(enc) => enc.ec_tell_frac(),
            Self::Decoder(dec) => dec.ec_tell_frac(),
        };
        i32::try_from(bits).unwrap_or(i32::MAX)
    }

    /// Frame size in bytes.
    #[must_use]
    pub fn storage(&self) -> usize {
        match self {
            Self::Encoder(enc) => enc.storage(),
            Self::Decoder(dec) => dec.storage(),
        }
    }

    pub fn code_bit_logp(&mut self, value: bool, logp: u32) -> bool {
        match self {
            Self::Encoder(enc) => {
                enc.ec_enc_bit_logp(value, logp);
                value
            }
            Self::Decoder(dec) => dec.ec_dec_bit_logp(logp),
        }
    }

    pub fn code_bits(&mut self, value: u32, bits: u32) -> u32 {
        match self {
            Self::Encoder(enc) => {
                enc.ec_enc_bits(value, bits);
                value
            }
            Self::Decoder(dec) => dec.ec_dec_bits(bits),
        }
    }

    pub fn code_uint(&mut self, value: u32, ft: u32) -> u32 {
        match self {
            Self::Encoder(enc) => {
                enc.ec_enc_uint(value, ft);
                value
            }
            Self::Decoder(dec) => dec.ec_dec_uint(ft),
        }
    }

    /// Laplace-distributed residual; the encoder may clamp `value` to what
    /// the model can represent and returns what was actually coded.
    pub fn code_laplace(&mut self, value: i32, fs: u32, decay: u32) -> i32 {
        match self {
            Self::Encoder(enc) => enc.ec_laplace_encode(value, fs, decay),
            Self::Decoder(dec) => dec.ec_laplace_decode(fs, decay),
        }
    }

    pub fn code_icdf(&mut self, symbol: usize, icdf: &[u8], ftb: u32) -> usize {
        match self {
            Self::Encoder(enc) => {
                enc.ec_enc_icdf(symbol, icdf, ftb);
                symbol
            }
            Self::Decoder(dec) => dec.ec_dec_icdf(icdf, ftb),
        }
    }

    /// Treats the rest of the frame as consumed, as after a silence flag.
    pub fn skip_to_end(&mut self) {
        match self {
            Self::Encoder(enc) => enc.skip_to_end(),
            Self::Decoder(dec) => dec.skip_to_end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(72 << 7, 127 << 6, 5925 ; "model_start")]
    #[test_case(0, 0, 16368 ; "flat")]
    #[test_case(0, 16384, 0 ; "full_decay")]
    fn test_laplace_freq1(fs0: u32, decay: u32, expected: u32) {
        assert_eq!(laplace_freq1(fs0, decay), expected);
    }

    #[test]
    fn test_coder_walk_is_shared_by_both_sides() {
        type Walk = (bool, u32, u32, usize, i32);
        fn walk(coder: &mut Coder<'_>, values: Walk) -> Walk {
            let bit = coder.code_bit_logp(values.0, 2);
            let raw = coder.code_bits(values.1, 5);
            let uint = coder.code_uint(values.2, 300);
            let sym = coder.code_icdf(values.3, &[25, 23, 2, 0], 5);
            let residual = coder.code_laplace(values.4, 72 << 7, 127 << 6);
            (bit, raw, uint, sym, residual)
        }

        let values = (true, 19, 271, 2, -3);
        let mut encoder = RangeEncoder::new(16).unwrap();
        {
            let mut coder = Coder::Encoder(&mut encoder);
            assert!(coder.is_encoder());
            assert_eq!(walk(&mut coder, values), values);
        }
        let tell = encoder.ec_tell();
        let frame = encoder.finish().unwrap();

        let mut decoder = RangeDecoder::new(&frame).unwrap();
        let mut coder = Coder::Decoder(&mut decoder);
        assert_eq!(walk(&mut coder, (false, 0, 0, 0, 0)), values);
        assert_eq!(coder.tell(), i32::try_from(tell).unwrap());
        assert_eq!(coder.storage(), 16);
    }
}
