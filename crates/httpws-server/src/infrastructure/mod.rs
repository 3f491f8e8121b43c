//! Infrastructure layer for httpws-server.
//!
//! Everything that touches a socket or the filesystem lives here.
//!
//! # Responsibilities
//!
//! - Binding the listener and accepting connections (tokio)
//! - Handing each socket to a dedicated worker thread
//! - Optional TLS on the accepted socket (rustls)
//! - Parsing HTTP/1.1 requests and writing responses
//! - Serving static files and checking Basic authentication
//! - Handing upgrade requests to `httpws-core`

pub mod http;
pub mod server;
pub mod stream;
pub mod tls;

pub use server::{bind_listener, run_server, serve};
