//! HTTP ↔ FastCGI bridge.
//!
//! # Data Flow
//! ```text
//! axum handler
//!     → request.rs (CGI param translation, BridgeRequest)
//!     → engine.rs (pending queue → in-flight map, record emission)
//!     → backend.rs (connect with backoff, get-values exchange)
//!     → backend Unix socket
//!
//! Backend stdout records
//!     → engine.rs (route by request id)
//!     → response.rs (header/body split, status extraction)
//!     → streamed back to the axum handler
//! ```
//!
//! # Responsibilities
//! - Own every request from arrival to completion
//! - Keep at most one request on the wire unless the backend multiplexes
//! - Decide, on connection loss, which requests are safe to replay

pub mod backend;
pub mod engine;
pub mod request;
pub mod response;

pub use backend::ConnectError;
pub use engine::{spawn, GatewayError, GatewayHandle};
pub use request::{BridgeError, BridgeRequest, ResponseHead, ServerInfo};
