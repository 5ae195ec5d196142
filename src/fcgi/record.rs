//! FastCGI protocol data model.
//!
//! # Responsibilities
//! - Define the fixed 8-byte record header
//! - Define the closed set of record types and their decoded bodies
//! - Allocate application request ids (never 0, wraps past u16::MAX)
//!
//! # Design Decisions
//! - Record bodies are a tagged union: one variant per record type, plus an
//!   explicit `UnknownType` variant so unrecognized records stay observable
//! - Params keep insertion order and tolerate duplicate names

use bytes::Bytes;

/// Protocol version this gateway speaks.
pub const FCGI_VERSION: u8 = 1;

/// Size of the fixed record header on the wire.
pub const HEADER_LEN: usize = 8;

/// Request id reserved for connection-wide management records.
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// Variable names queried in the get-values exchange.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// Record types defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
}

impl RecordType {
    /// Map a wire byte to a known record type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::BeginRequest),
            2 => Some(RecordType::AbortRequest),
            3 => Some(RecordType::EndRequest),
            4 => Some(RecordType::Params),
            5 => Some(RecordType::Stdin),
            6 => Some(RecordType::Stdout),
            7 => Some(RecordType::Stderr),
            8 => Some(RecordType::Data),
            9 => Some(RecordType::GetValues),
            10 => Some(RecordType::GetValuesResult),
            _ => None,
        }
    }
}

/// FastCGI application roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

impl Role {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// Protocol status carried in an end-request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

impl ProtocolStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProtocolStatus::RequestComplete),
            1 => Some(ProtocolStatus::CantMpxConn),
            2 => Some(ProtocolStatus::Overloaded),
            3 => Some(ProtocolStatus::UnknownRole),
            _ => None,
        }
    }
}

/// The fixed header preceding every record body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub kind: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    /// Total on-wire size of the record this header describes.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }
}

/// A decoded record: id plus a body interpreted per its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub request_id: u16,
    pub body: RecordBody,
}

/// Decoded record bodies, one variant per record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    BeginRequest { role: Role, keep_connection: bool },
    AbortRequest,
    EndRequest { app_status: u32, protocol_status: ProtocolStatus },
    Params(Vec<(Bytes, Bytes)>),
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    Data(Bytes),
    GetValues(Vec<Bytes>),
    GetValuesResult(Vec<(Bytes, Bytes)>),
    /// Record type outside the known enumeration; surfaced, never dropped.
    UnknownType { kind: u8, body: Bytes },
}

/// Allocator for application request ids.
///
/// Ids increase monotonically for the life of the process and are never 0.
/// Past u16::MAX the counter wraps back to 1; callers must skip ids that are
/// still in flight at the time of the wrap.
#[derive(Debug)]
pub struct RequestIdAllocator {
    next: u16,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Hand out the next id, skipping 0 and any id the caller reports busy.
    pub fn next_id<F: Fn(u16) -> bool>(&mut self, is_busy: F) -> u16 {
        loop {
            let id = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if id != MANAGEMENT_REQUEST_ID && !is_busy(id) {
                return id;
            }
        }
    }
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_round_trip() {
        for byte in 1..=10u8 {
            let kind = RecordType::from_u8(byte).unwrap();
            assert_eq!(kind as u8, byte);
        }
        assert_eq!(RecordType::from_u8(0), None);
        assert_eq!(RecordType::from_u8(11), None);
    }

    #[test]
    fn id_allocator_starts_at_one() {
        let mut ids = RequestIdAllocator::new();
        assert_eq!(ids.next_id(|_| false), 1);
        assert_eq!(ids.next_id(|_| false), 2);
    }

    #[test]
    fn id_allocator_wraps_and_skips_busy() {
        let mut ids = RequestIdAllocator { next: u16::MAX };
        assert_eq!(ids.next_id(|_| false), u16::MAX);
        // Wrapped past the reserved management id.
        assert_eq!(ids.next_id(|id| id == 1), 2);
    }
}
