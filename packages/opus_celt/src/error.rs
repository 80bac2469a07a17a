use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Range decoder error: {0}")]
    RangeDecoder(String),

    #[error("Range encoder error: {0}")]
    RangeEncoder(String),

    #[error("Corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("Frame does not fit in {0} bytes")]
    BufferOverflow(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_buffer_overflow() {
        let err = Error::BufferOverflow(12);
        assert_eq!(err.to_string(), "Frame does not fit in 12 bytes");
    }

    #[test]
    fn test_error_display_corrupt_frame() {
        let err = Error::CorruptFrame("range decoder error flag set".to_string());
        assert_eq!(
            err.to_string(),
            "Corrupt frame: range decoder error flag set"
        );
    }
}
