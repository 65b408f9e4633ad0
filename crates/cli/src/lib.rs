//! Command implementations for the `phantom` binary.
pub mod commands;
