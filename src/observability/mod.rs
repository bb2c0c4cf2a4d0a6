//! Observability for the device client: structured logging and per-connection
//! metrics.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ClientMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{command_span, connection_span, publish_span};
