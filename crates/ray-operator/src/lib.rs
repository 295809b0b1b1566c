//! Ray operator: wires the Ray controller into a running process

#![deny(missing_docs)]

/// Controller construction
pub mod controller_runner;
