//! Crate-level error type.
//!
//! Configuration problems are fatal and surface here before any sampling
//! starts. Per-replicate numerical trouble never does: the battery turns it
//! into a `NaN` p-value and the analyzer counts it.

use thiserror::Error;

/// Every fallible operation in the crate returns this error.
#[derive(Error, Debug)]
pub enum SimError {
    /// A parameter is outside its valid domain.
    #[error("invalid config: {field} {reason}")]
    InvalidConfig {
        /// Name of the offending parameter (e.g. `"base_ctr"`).
        field: &'static str,
        /// Human-readable description including the rejected value.
        reason: String,
    },

    /// A distribution could not be constructed from computed parameters.
    #[error("statistics error: {0}")]
    Statistics(String),

    /// The run was cancelled between replicates.
    #[error("simulation cancelled")]
    Cancelled,

    /// The configuration file could not be read.
    #[error("failed to read config '{file}': {source}")]
    ConfigIo {
        file: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::config::SimulationConfig`].
    #[error("failed to parse config '{file}': {source}")]
    ConfigParse {
        file: String,
        #[source]
        source: toml::de::Error,
    },

    /// The report could not be serialized.
    #[error("report serialization failed: {0}")]
    Report(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl SimError {
    /// Shorthand for building an [`SimError::InvalidConfig`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SimError::InvalidConfig { field, reason: reason.into() }
    }

    /// `true` for errors caused by bad input parameters.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SimError::InvalidConfig { .. } | SimError::ConfigIo { .. } | SimError::ConfigParse { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display_names_field() {
        let e = SimError::invalid("skew", "must be > 0, got -1");
        assert_eq!(e.to_string(), "invalid config: skew must be > 0, got -1");
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(SimError::Cancelled.to_string(), "simulation cancelled");
    }

    #[test]
    fn test_is_config_error() {
        assert!(SimError::invalid("alpha", "bad").is_config_error());
        assert!(!SimError::Cancelled.is_config_error());
        assert!(!SimError::Worker("boom".into()).is_config_error());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: SimError = io.into();
        assert!(matches!(e, SimError::Io(_)));
    }
}
