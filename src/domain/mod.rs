//! Domain layer: task records, naming rules and their invariants.

pub mod error;
pub mod sources;
pub mod tasks;
