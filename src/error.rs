//! Error types for the gzip filter layer
//!
//! Every failure is local to the transfer that owns the failing context.
//! Nothing in this layer retries; the caller decides.

use std::io;
use thiserror::Error;

/// Errors raised while driving a fetch or delivery filter
#[derive(Debug, Error)]
pub enum FilterError {
    /// Scratch buffer, read buffer or storage segment could not be obtained
    #[error("allocation failure: {what} ({size} bytes)")]
    AllocationFailure { what: &'static str, size: usize },

    /// The codec engine reported a fault (malformed input or internal error)
    #[error("{tag}: codec error: {message}")]
    Codec { tag: String, message: String },

    /// Finalize was reached without the engine ever reporting logical end
    #[error("{tag}: stream ended prematurely")]
    PrematureEnd { tag: String },

    /// The engine reported logical end while input was still unconsumed
    #[error("{tag}: junk after gzip data ({unconsumed} bytes)")]
    TrailingGarbage { tag: String, unconsumed: usize },

    /// Backend read failed; propagated verbatim
    #[error("backend read failed: {0}")]
    Backend(#[source] io::Error),

    /// Downstream sink refused bytes
    #[error("sink write failed: {0}")]
    Sink(#[source] io::Error),
}

impl FilterError {
    pub(crate) fn codec(tag: &str, message: impl Into<String>) -> Self {
        FilterError::Codec {
            tag: tag.to_string(),
            message: message.into(),
        }
    }

    /// Short label used in logs and statistics
    pub fn kind(&self) -> &'static str {
        match self {
            FilterError::AllocationFailure { .. } => "allocation_failure",
            FilterError::Codec { .. } => "codec_error",
            FilterError::PrematureEnd { .. } => "premature_end",
            FilterError::TrailingGarbage { .. } => "trailing_garbage",
            FilterError::Backend(_) => "short_read",
            FilterError::Sink(_) => "sink_error",
        }
    }
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_are_distinct() {
        let errors = [
            FilterError::AllocationFailure { what: "scratch buffer", size: 1 },
            FilterError::codec("U F -", "bad"),
            FilterError::PrematureEnd { tag: "U F -".into() },
            FilterError::TrailingGarbage { tag: "u F -".into(), unconsumed: 3 },
            FilterError::Backend(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            FilterError::Sink(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")),
        ];
        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_display_carries_engine_message() {
        let err = FilterError::codec("U F -", "incorrect header check");
        assert_eq!(err.to_string(), "U F -: codec error: incorrect header check");
    }
}
