//! ewb command-line interface
//!
//! Parses arguments, resolves the configuration, and drives the
//! [`ewb_core::Orchestrator`] and [`ewb_core::ResultAccessor`]. The binary in
//! `main.rs` is a thin wrapper around [`commands::execute`].

pub mod cli;
pub mod commands;
pub mod progress;
pub mod shutdown;
pub mod tracing;
