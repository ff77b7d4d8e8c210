//! Observability for the session engine and CLI
//!
//! Structured logging only; see [`logging`] for the environment variables.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
