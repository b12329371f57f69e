//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod proxy;
pub mod telemetry;
