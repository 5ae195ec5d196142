//! FastCGI protocol layer.
//!
//! # Data Flow
//! ```text
//! Backend socket bytes (any chunking)
//!     → framer.rs (reassemble on record boundaries, pause/resume)
//!     → codec.rs (decode header + body per record type)
//!     → record.rs types consumed by the gateway engine
//!
//! Outbound:
//!     gateway engine
//!     → codec.rs (encode begin-request / params / stdin records)
//!     → backend socket
//! ```
//!
//! # Design Decisions
//! - Framing and decoding are separate: the framer never interprets bodies,
//!   the codec never buffers partial input
//! - Record bodies are a closed tagged union; unknown types are surfaced as
//!   an explicit variant for observability

pub mod codec;
pub mod framer;
pub mod record;

pub use codec::CodecError;
pub use framer::{FramerError, RecordFramer};
pub use record::{Record, RecordBody, RecordHeader, RecordType};
