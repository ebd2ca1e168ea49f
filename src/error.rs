//! Crate error taxonomy.
//!
//! Only two classes of failure ever surface as an `Err` to a caller of
//! this crate: invalid configuration and a build that would leave the
//! pipeline with no usable stages or sinks. Everything else a running
//! pipeline encounters is routed to [`crate::diagnostics`] instead.

use thiserror::Error;

/// GitHub issue tracker URL surfaced in error messages for user feedback.
const ISSUE_TRACKER: &str = "https://github.com/fapilog-rs/fapilog";

/// Errors that can be returned from building or configuring a pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value failed validation (env var or builder call).
    #[error(
        "invalid configuration for '{key}': {reason} (got {value:?}); {ISSUE_TRACKER}"
    )]
    Config {
        key: String,
        value: String,
        reason: String,
    },

    /// A plugin (enricher, redactor, filter, sink) failed to load and no
    /// fallback left the pipeline usable.
    #[error("plugin '{name}' failed to load: {reason}; {ISSUE_TRACKER}")]
    PluginLoad { name: String, reason: String },

    /// The builder produced a pipeline with no sinks and no stages capable
    /// of ever writing a record anywhere.
    #[error("pipeline has no usable sinks after validation; {ISSUE_TRACKER}")]
    NoUsableSinks,

    /// A plugin manifest declared an API major version the host doesn't
    /// support.
    #[error(
        "plugin '{name}' declares api major {declared}, host supports {supported}; {ISSUE_TRACKER}"
    )]
    ApiVersionMismatch {
        name: String,
        declared: u32,
        supported: u32,
    },

    /// I/O failure during pipeline startup (e.g. cannot create the log
    /// directory for the rotating file sink).
    #[error("I/O error during startup: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for build/configuration-time operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_includes_key_and_issue_tracker() {
        let err = Error::Config {
            key: "FAPILOG__QUEUE__CAPACITY".to_string(),
            value: "-1".to_string(),
            reason: "must be a positive integer".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("FAPILOG__QUEUE__CAPACITY"));
        assert!(msg.contains(ISSUE_TRACKER));
    }

    #[test]
    fn no_usable_sinks_display() {
        let err = Error::NoUsableSinks;
        assert!(err.to_string().contains("no usable sinks"));
    }
}
