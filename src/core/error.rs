use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error("invalid mortgage track '{track}': {reason}")]
    InvalidMortgage { track: String, reason: String },

    #[error("scenarios cannot be compared: {reason}")]
    IncomparableScenarios { reason: String },

    #[error("simulation cancelled before block starting at path {next_row}")]
    Cancelled { next_row: usize },
}

impl EngineError {
    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }

    pub fn invalid_mortgage(track: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMortgage {
            track: track.into(),
            reason: reason.into(),
        }
    }

    pub fn incomparable(reason: impl Into<String>) -> Self {
        Self::IncomparableScenarios {
            reason: reason.into(),
        }
    }
}
