//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Pidfile → Spawn backend → Start listener
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain in-flight → Stop backend
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then backend process, then listener
//! - Shutdown is broadcast so every long-running task observes it

pub mod shutdown;

pub use shutdown::Shutdown;
