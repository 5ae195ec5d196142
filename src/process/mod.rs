//! Backend process collaborators.
//!
//! # Data Flow
//! ```text
//! CLI trailing arguments
//!     → launcher.rs (spawn, line relay, exit status)
//!
//! --pidfile flag
//!     → pidfile.rs (exclusive create, removed on drop)
//! ```

pub mod launcher;
pub mod pidfile;

pub use launcher::{BackendProcess, LaunchError, STARTUP_GRACE};
pub use pidfile::{Pidfile, PidfileError};
