//! # rttpd
//!
//! A multi-threaded HTTP/1.1 static file server built on a readiness reactor.
//!
//! One thread waits on socket readiness and owns every connection that is not
//! currently being worked on; a fixed worker pool reads, parses, builds
//! responses and writes. File bodies are memory-mapped and sent with vectored
//! writes, and idle connections are evicted through a timer heap.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rttpd::config::ServerConfig;
//! use rttpd::server::Server;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 8080,
//!         ..ServerConfig::default()
//!     };
//!     let mut server = Server::bind(config)?;
//!     println!("Listening on http://{}", server.local_addr());
//!     server.run()?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod database;
pub mod http;
pub mod server;
pub mod timer;
pub mod workers;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use buffer::ByteBuffer;
pub use config::{ServerConfig, TriggerMode};
pub use http::{Headers, HttpRequest, HttpResponse, Method, StatusCode};
pub use server::{Server, ServerError, ShutdownHandle};
