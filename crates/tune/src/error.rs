use thiserror::Error;

#[derive(Error, Debug)]
pub enum TuneError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sweep config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid sweep config: {0}")]
    InvalidSweep(String),

    #[error("invalid problem: {0}")]
    InvalidProblem(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, TuneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_sweep() {
        let e = TuneError::InvalidSweep("num_warps is empty".to_string());
        assert_eq!(e.to_string(), "invalid sweep config: num_warps is empty");
    }

    #[test]
    fn error_display_invalid_problem() {
        let e = TuneError::InvalidProblem("top_k=3 must be in 1..=2".to_string());
        assert_eq!(e.to_string(), "invalid problem: top_k=3 must be in 1..=2");
    }

    #[test]
    fn error_from_candle() {
        let e: TuneError = candle_core::Error::Msg("boom".to_string()).into();
        assert!(matches!(e, TuneError::Candle(_)));
        assert_eq!(e.to_string(), "candle error: boom");
    }
}
