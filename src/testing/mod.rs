//! Testing utilities
//!
//! An in-memory transport and a scripted broker for exercising the session
//! engine without a real MQTT server.

pub mod mocks;

pub use mocks::*;
