//! CLI module for the `tls` verb group.
//!
//! Thin command handlers over the library core plus output formatting.

mod commands;
mod output;

pub use commands::*;
