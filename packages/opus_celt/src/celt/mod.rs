pub mod bands;
mod config;
mod constants;
pub mod cwrs;
mod decoder;
mod encoder;
mod energy;
mod frame;
mod math;
pub mod rate;
pub mod vq;

use std::ops::Range;

pub use config::{Bandwidth, CeltConfig, FrameParams, Spread};
pub use constants::{MAX_LM, NUM_BANDS, SHORT_MDCT_SIZE};
pub use decoder::{CeltDecoder, DecodedFrame};
pub use encoder::{CeltEncoder, EncodedFrame, MAX_FRAME_BYTES, MIN_FRAME_BYTES, SpectralFrame};
pub use energy::{BandEnergies, EnergyState};
pub use frame::PostFilterParams;

/// MDCT bins of `band` in a frame of `120 << lm` bins per channel.
#[must_use]
pub const fn band_range(band: usize, lm: u8) -> Range<usize> {
    constants::EBANDS[band] << lm..constants::EBANDS[band + 1] << lm
}
