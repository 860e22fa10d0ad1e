//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod scratch;
pub mod telemetry;
pub mod toolchain;
pub mod uploads;
