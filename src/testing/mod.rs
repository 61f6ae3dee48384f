//! Testing utilities
//!
//! Scriptable in-memory transport for exercising broker selection and
//! failover without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
