//! Configuration module for the stream recorder
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and fail-fast validation.

pub mod config;

pub use config::*;
