//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, catch-all route)
//!     → gateway (CGI translation, FastCGI dispatch)
//!     → server.rs (stream response body to client)
//! ```

pub mod server;

pub use server::HttpServer;
