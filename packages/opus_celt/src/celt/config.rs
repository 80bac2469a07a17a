use crate::Channels;
use crate::error::{Error, Result};

use super::constants::{MAX_LM, NUM_BANDS};

/// Spreading (pseudo-rotation) strength, RFC 6716 Section 4.3.4.3.
///
/// The discriminants are the symbol values coded in the bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Spread {
    None = 0,
    Light = 1,
    #[default]
    Normal = 2,
    Aggressive = 3,
}

impl Spread {
    /// Maps a decoded spread symbol to its variant.
    #[must_use]
    pub const fn from_symbol(symbol: usize) -> Self {
        match symbol {
            0 => Self::None,
            1 => Self::Light,
            3 => Self::Aggressive,
            _ => Self::Normal,
        }
    }
}

/// Audio bandwidth, which bounds the highest coded band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    Narrowband,
    Mediumband,
    Wideband,
    SuperWideband,
    Fullband,
}

impl Bandwidth {
    /// One past the last coded band.
    #[must_use]
    pub const fn end_band(self) -> usize {
        match self {
            Self::Narrowband => 13,
            Self::Mediumband | Self::Wideband => 17,
            Self::SuperWideband => 19,
            Self::Fullband => 21,
        }
    }
}

/// Stream-level configuration shared by [`super::CeltEncoder`] and
/// [`super::CeltDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CeltConfig {
    pub channels: Channels,
    pub start_band: usize,
    pub end_band: usize,
    /// Encoder only: reconstruct the quantized spectrum while coding, which
    /// enables spectral folding from previously coded bands.
    pub resynthesis: bool,
}

impl Default for CeltConfig {
    fn default() -> Self {
        Self {
            channels: Channels::Mono,
            start_band: 0,
            end_band: NUM_BANDS,
            resynthesis: false,
        }
    }
}

impl CeltConfig {
    #[must_use]
    pub const fn with_channels(mut self, channels: Channels) -> Self {
        self.channels = channels;
        self
    }

    #[must_use]
    pub const fn with_start_band(mut self, start_band: usize) -> Self {
        self.start_band = start_band;
        self
    }

    #[must_use]
    pub const fn with_end_band(mut self, end_band: usize) -> Self {
        self.end_band = end_band;
        self
    }

    #[must_use]
    pub const fn with_bandwidth(mut self, bandwidth: Bandwidth) -> Self {
        self.end_band = bandwidth.end_band();
        self
    }

    #[must_use]
    pub const fn with_resynthesis(mut self, resynthesis: bool) -> Self {
        self.resynthesis = resynthesis;
        self
    }

    /// # Errors
    ///
    /// * [`Error::InvalidConfig`] if the band range is empty or out of bounds
    pub fn validate(&self) -> Result<()> {
        if self.end_band > NUM_BANDS || self.end_band == 0 {
            return Err(Error::InvalidConfig(format!(
                "end band {} outside 1..={NUM_BANDS}",
                self.end_band
            )));
        }
        if self.start_band >= self.end_band {
            return Err(Error::InvalidConfig(format!(
                "start band {} must be below end band {}",
                self.start_band, self.end_band
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn channel_count(&self) -> usize {
        self.channels.count()
    }
}

/// Per-frame decisions made by the analysis stage and coded into the frame.
///
/// These are the encoder's inputs to the allocator and band quantizer. Their
/// derivation (transient detection, spreading and trim analysis, dynamic
/// allocation) happens outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameParams {
    /// Frame size as `log2(frame_size / 120)`.
    pub lm: u8,
    pub transient: bool,
    pub intra: bool,
    pub spread: Spread,
    /// Allocation tilt, 0..=10 with 5 meaning neutral.
    pub alloc_trim: usize,
    /// Dynamic allocation boosts per band, in quanta.
    pub boosts: Vec<u32>,
    /// Per-band time-frequency resolution change flags.
    pub tf_change: Vec<bool>,
    pub tf_select: bool,
    /// First band coded as intensity stereo.
    pub intensity: usize,
    pub dual_stereo: bool,
    /// Last band holding signal; the allocator avoids skipping below it.
    pub signal_bandwidth: Option<usize>,
    /// Forces the anti-collapse flag; by default it is set unless the
    /// previous two frames were both transient.
    pub anti_collapse: Option<bool>,
    pub silence: bool,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            lm: MAX_LM,
            transient: false,
            intra: false,
            spread: Spread::Normal,
            alloc_trim: 5,
            boosts: Vec::new(),
            tf_change: Vec::new(),
            tf_select: false,
            intensity: NUM_BANDS,
            dual_stereo: false,
            signal_bandwidth: None,
            anti_collapse: None,
            silence: false,
        }
    }
}

impl FrameParams {
    #[must_use]
    pub const fn with_lm(mut self, lm: u8) -> Self {
        self.lm = lm;
        self
    }

    #[must_use]
    pub const fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    #[must_use]
    pub const fn with_intra(mut self, intra: bool) -> Self {
        self.intra = intra;
        self
    }

    #[must_use]
    pub const fn with_spread(mut self, spread: Spread) -> Self {
        self.spread = spread;
        self
    }

    #[must_use]
    pub const fn with_alloc_trim(mut self, alloc_trim: usize) -> Self {
        self.alloc_trim = alloc_trim;
        self
    }

    #[must_use]
    pub fn with_boosts(mut self, boosts: Vec<u32>) -> Self {
        self.boosts = boosts;
        self
    }

    #[must_use]
    pub fn with_tf_change(mut self, tf_change: Vec<bool>, tf_select: bool) -> Self {
        self.tf_change = tf_change;
        self.tf_select = tf_select;
        self
    }

    #[must_use]
    pub const fn with_intensity(mut self, intensity: usize) -> Self {
        self.intensity = intensity;
        self
    }

    #[must_use]
    pub const fn with_dual_stereo(mut self, dual_stereo: bool) -> Self {
        self.dual_stereo = dual_stereo;
        self
    }

    #[must_use]
    pub const fn with_signal_bandwidth(mut self, band: usize) -> Self {
        self.signal_bandwidth = Some(band);
        self
    }

    #[must_use]
    pub const fn with_anti_collapse(mut self, anti_collapse: bool) -> Self {
        self.anti_collapse = Some(anti_collapse);
        self
    }

    #[must_use]
    pub const fn with_silence(mut self, silence: bool) -> Self {
        self.silence = silence;
        self
    }

    /// # Errors
    ///
    /// * [`Error::InvalidConfig`] if `lm` or `alloc_trim` is out of range
    pub fn validate(&self) -> Result<()> {
        if self.lm > MAX_LM {
            return Err(Error::InvalidConfig(format!(
                "LM {} outside 0..={MAX_LM}",
                self.lm
            )));
        }
        if self.alloc_trim > 10 {
            return Err(Error::InvalidConfig(format!(
                "allocation trim {} outside 0..=10",
                self.alloc_trim
            )));
        }
        Ok(())
    }

    pub(crate) fn boost(&self, band: usize) -> u32 {
        self.boosts.get(band).copied().unwrap_or(0)
    }

    pub(crate) fn tf_change(&self, band: usize) -> bool {
        self.tf_change.get(band).copied().unwrap_or(false)
    }
}
