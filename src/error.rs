//! Custom error types for the engine.
//!
//! This module defines the primary error type, `EngineError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from serial transport problems to lifecycle precondition violations.
//!
//! ## Error Taxonomy
//!
//! - **`Config`** / **`Configuration`**: file/format errors from `figment`
//!   versus semantic errors caught by the validation step (e.g. an operator
//!   list that does not contain exactly two entries).
//! - **`Io`**: standard `std::io::Error`, covering raw port I/O.
//! - **`Transport`**: serial-port open/write/close failures. These are
//!   recovered locally by the owning session's poll cycle and never fatal to
//!   the whole engine.
//! - **`Pattern`**: a malformed pattern definition. This is a programming
//!   error surfaced at descriptor construction time, not at match time.
//!   Responses that match no pattern are silently ignored, they are not
//!   errors.
//! - **`Precondition`**: a rejected control-surface call (`start()` before
//!   `init()`, double `init`). No state change occurs.
//! - **`NotFound`**: a lookup miss (modem row absent, expert unknown). The
//!   caller degrades gracefully.
//! - **`BarrierTimeout`**: the optional cap on a progress barrier elapsed
//!   before the port reached 100 %.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error on {path}: {message}")]
    Transport { path: String, message: String },

    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    #[error("Invalid pattern '{name}': {message}")]
    Pattern { name: String, message: String },

    #[error("Precondition violation: {0}")]
    Precondition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Barrier timed out for port {port} at {progress:.2}%")]
    BarrierTimeout { port: usize, progress: f64 },

    #[error("Store error: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_name_the_port() {
        let err = EngineError::Transport {
            path: "/dev/ttyUSB2".into(),
            message: "device reports readiness to read but returned no data".into(),
        };
        assert!(err.to_string().contains("/dev/ttyUSB2"));
    }
}
