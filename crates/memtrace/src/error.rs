use thiserror::Error;

/// Errors produced while reading tracer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid trace level `{0}`, expected one of: none, bytes, stacks")]
    InvalidLevel(String),

    #[error("invalid report format `{0}`, expected one of: log, table, json, json-pretty")]
    InvalidFormat(String),

    #[error("invalid frame limit `{0}`, expected a non-negative integer")]
    InvalidFrames(String),
}
