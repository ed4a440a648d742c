//! Configuration management module.
//!
//! A single TOML-backed `Configuration` object, constructed once at
//! startup and swapped atomically on reconfiguration.

mod config;

pub use config::*;
