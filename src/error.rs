//! Error types for lattix-invariant.

use thiserror::Error;

/// Error type for invariance training.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Invalid or unrecognized configuration value.
    #[error("invalid config: {0}")]
    Config(String),

    /// An environment-dependent step ran before `initialize_environment_adjacency`.
    #[error("environment adjacency not initialized: call initialize_environment_adjacency first")]
    EnvironmentNotInitialized,

    /// Environment index outside `[0, count)`.
    #[error("environment index {index} out of range (num_envs = {count})")]
    EnvironmentOutOfRange { index: usize, count: usize },

    /// Tensor shape does not match what the operation expects.
    #[error("shape error: {0}")]
    Shape(String),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Class label outside `[0, num_classes)`.
    #[error("label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: u32, num_classes: usize },

    /// Edge endpoint outside `[0, num_nodes)`.
    #[error("edge endpoint {node} out of range for {num_nodes} nodes")]
    NodeOutOfRange { node: usize, num_nodes: usize },

    /// Weighted sampling failed.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// Parameter store lock was poisoned by a panicking thread.
    #[error("parameter store poisoned")]
    Poisoned,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
