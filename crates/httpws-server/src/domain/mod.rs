//! Domain layer for httpws-server.
//!
//! Only configuration lives here: plain structs that the binary fills in from
//! the CLI and an optional TOML file, and that the rest of the crate reads.

pub mod config;

pub use config::{load_config, BasicAuth, ConfigError, FileConfig, ServerConfig, TlsPaths};
