//! Engine error taxonomy.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Fatal for the user's run, never attempted.
    Configuration,
    /// Degrades to an empty recommendation list.
    Backend,
    /// Counted against a single recommendation.
    Execution,
    /// Recorded per user by the fleet runner.
    Fleet,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("backend returned {status}: {body}")]
    BackendError { status: u16, body: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("no quote available for {0}")]
    QuoteUnavailable(String),

    #[error("cannot sell {requested} shares of {symbol}: holding {held}")]
    Oversell {
        symbol: String,
        requested: f64,
        held: f64,
    },

    #[error("invalid recommendation: {0}")]
    InvalidRecommendation(String),

    #[error("store write failed: {0}")]
    Store(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unknown user {0}")]
    UnknownUser(String),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotConfigured(_) => ErrorCategory::Configuration,
            Self::BackendUnreachable(_)
            | Self::BackendError { .. }
            | Self::MalformedResponse(_) => ErrorCategory::Backend,
            Self::QuoteUnavailable(_)
            | Self::Oversell { .. }
            | Self::InvalidRecommendation(_)
            | Self::Store(_) => ErrorCategory::Execution,
            Self::Unauthorized(_) | Self::UnknownUser(_) => ErrorCategory::Fleet,
        }
    }

    pub fn store(e: anyhow::Error) -> Self {
        Self::Store(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            EngineError::NotConfigured("x".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            EngineError::BackendError {
                status: 502,
                body: "bad gateway".into()
            }
            .category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            EngineError::Oversell {
                symbol: "AAPL".into(),
                requested: 10.0,
                held: 5.0
            }
            .category(),
            ErrorCategory::Execution
        );
    }

    #[test]
    fn oversell_message_names_symbol() {
        let e = EngineError::Oversell {
            symbol: "AAPL".into(),
            requested: 10.0,
            held: 5.0,
        };
        assert_eq!(e.to_string(), "cannot sell 10 shares of AAPL: holding 5");
    }
}
