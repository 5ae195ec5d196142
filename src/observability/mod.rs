//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!
//! Consumers:
//!     → Log aggregation (stdout, RUST_LOG filtered)
//! ```
//!
//! # Design Decisions
//! - Structured logging with per-request fields (request_id, method, target)
//! - Level configurable via environment without recompiling

pub mod logging;
