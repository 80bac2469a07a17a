#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! # `MoosicBox` Opus CELT Core
//!
//! Bit-exact fixed-point implementation of the CELT spectral coding layer of
//! `RFC 6716`, matching the libopus 1.1 fixed-point reference at the 48 kHz
//! static mode (21 bands, 2.5 to 20 ms frames).
//!
//! The crate covers everything between the MDCT and the bitstream:
//!
//! * [`range`]: the range coder shared by every CELT symbol
//! * PVQ codebook indexing and the algebraic vector quantizer
//! * the recursive band quantizer with stereo coding, folding and anti-collapse
//! * the bit allocator, including inline band skipping
//! * coarse, fine and final band energy coding
//!
//! [`CeltEncoder`] and [`CeltDecoder`] walk a whole frame. Both sides read
//! and write the exact same sequence of symbols, so the decoder reproduces
//! the encoder's quantized spectrum and final range value.
//!
//! ```rust
//! use moosicbox_opus_celt::{CeltConfig, CeltDecoder, CeltEncoder, FrameParams, SpectralFrame};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CeltConfig::default();
//! let mut encoder = CeltEncoder::new(config.clone())?;
//! let mut decoder = CeltDecoder::new(config)?;
//!
//! let params = FrameParams::default().with_lm(3);
//! let frame = SpectralFrame::silent(&params, 1);
//! let encoded = encoder.encode_frame(&frame, &params, 40)?;
//!
//! let decoded = decoder.decode_frame(&encoded.bytes, 3)?;
//! assert_eq!(decoded.final_range, encoded.final_range);
//! # Ok(())
//! # }
//! ```

mod celt;
pub mod error;
pub mod range;
mod util;

pub use celt::{
    BandEnergies, Bandwidth, CeltConfig, CeltDecoder, CeltEncoder, DecodedFrame, EncodedFrame,
    EnergyState, FrameParams, MAX_FRAME_BYTES, MAX_LM, MIN_FRAME_BYTES, NUM_BANDS,
    PostFilterParams, SHORT_MDCT_SIZE, SpectralFrame, Spread, band_range, bands, cwrs, rate, vq,
};
pub use error::{Error, Result};

/// Channel layout of a CELT stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channels {
    #[default]
    Mono = 1,
    Stereo = 2,
}

impl Channels {
    #[must_use]
    pub const fn count(self) -> usize {
        self as usize
    }
}
