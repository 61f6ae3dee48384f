//! Observability for the adaptive publisher
//!
//! Structured logging only; broker metrics are exposed through
//! `AdaptivePublisher::get_broker_stats`.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
