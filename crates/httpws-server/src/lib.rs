//! httpws-server library crate.
//!
//! A small HTTP/1.1 server that serves static files and upgrades requests on
//! one path to WebSocket connections handled by `httpws-core`.
//!
//! # Architecture
//!
//! ```text
//! Browser (HTTP GET / WebSocket)
//!         ↕
//! [httpws-server]
//!   ├── domain/           ServerConfig, TOML file config
//!   ├── application/      Hub (fan-out), EchoApp (WsHandler), status broadcaster
//!   └── infrastructure/
//!         ├── http/       Request parsing, responses, static files, Basic auth
//!         └── server/     Accept loop (tokio) + one blocking worker per socket
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O beyond reading its own config file.
//! - `application` depends on `domain` and `httpws-core` only.
//! - `infrastructure` owns every socket and the tokio runtime glue.

/// Domain layer: configuration types.
pub mod domain;

/// Application layer: connection hub, echo handler, status broadcast.
pub mod application;

/// Infrastructure layer: HTTP parsing and the accept loop.
pub mod infrastructure;
