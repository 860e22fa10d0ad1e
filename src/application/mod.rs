//! Application services: task store, executor, dispatcher and retention.

pub mod compiler;
pub mod dispatcher;
pub mod error;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod toolchain;
