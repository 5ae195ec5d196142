//! Stateless encode/decode of FastCGI record headers and bodies.
//!
//! # Responsibilities
//! - Encode records (header + body, big-endian fixed-width fields)
//! - Encode/decode the name/value parameter list (1-or-4-byte length prefix)
//! - Decode begin-request, end-request and get-values-result bodies
//!
//! # Design Decisions
//! - Errors are per-record: a malformed body never corrupts decoding of the
//!   records that follow it
//! - Unknown record types decode to an explicit variant instead of an error

use bytes::{BufMut, Bytes, BytesMut};

use super::record::{
    ProtocolStatus, Record, RecordBody, RecordHeader, RecordType, Role, FCGI_VERSION, HEADER_LEN,
};

/// Error type for body decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed name/value length prefix")]
    BadLengthPrefix,
    #[error("parameter list truncated: need {needed} bytes, {available} available")]
    TruncatedParams { needed: usize, available: usize },
    #[error("record body too short for {kind:?}: {len} bytes")]
    TruncatedBody { kind: RecordType, len: usize },
    #[error("unknown role {0}")]
    UnknownRole(u16),
    #[error("unknown protocol status {0}")]
    UnknownProtocolStatus(u8),
    #[error("record content too long: {0} bytes")]
    ContentTooLong(usize),
}

/// Decode the fixed 8-byte header. Callers guarantee `buf.len() >= 8`.
pub fn decode_header(buf: &[u8]) -> RecordHeader {
    debug_assert!(buf.len() >= HEADER_LEN);
    RecordHeader {
        version: buf[0],
        kind: buf[1],
        request_id: u16::from_be_bytes([buf[2], buf[3]]),
        content_length: u16::from_be_bytes([buf[4], buf[5]]),
        padding_length: buf[6],
    }
}

/// Encode a complete record: header, body, no padding.
pub fn encode_record(kind: RecordType, request_id: u16, body: &[u8]) -> Result<Bytes, CodecError> {
    if body.len() > u16::MAX as usize {
        return Err(CodecError::ContentTooLong(body.len()));
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_u8(FCGI_VERSION);
    out.put_u8(kind as u8);
    out.put_u16(request_id);
    out.put_u16(body.len() as u16);
    out.put_u8(0); // padding length
    out.put_u8(0); // reserved
    out.put_slice(body);
    Ok(out.freeze())
}

/// Encode the 8-byte begin-request body.
pub fn encode_begin_request(role: Role, keep_connection: bool) -> [u8; 8] {
    let role = (role as u16).to_be_bytes();
    let flags = if keep_connection { 1 } else { 0 };
    [role[0], role[1], flags, 0, 0, 0, 0, 0]
}

/// Write one name/value length prefix: 1 byte below 128, otherwise 4 bytes
/// big-endian with the top bit set.
fn write_len(out: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    if len < 0x80 {
        out.put_u8(len as u8);
        Ok(())
    } else if len < 0x8000_0000 {
        out.put_u32(len as u32 | 0x8000_0000);
        Ok(())
    } else {
        Err(CodecError::ContentTooLong(len))
    }
}

/// Read one name/value length prefix, advancing `pos`.
fn read_len(buf: &[u8], pos: &mut usize) -> Result<usize, CodecError> {
    let first = *buf.get(*pos).ok_or(CodecError::BadLengthPrefix)?;
    if first < 0x80 {
        *pos += 1;
        Ok(first as usize)
    } else {
        if buf.len() < *pos + 4 {
            return Err(CodecError::BadLengthPrefix);
        }
        let raw = u32::from_be_bytes([buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
        *pos += 4;
        Ok((raw & 0x7FFF_FFFF) as usize)
    }
}

/// Encode a parameter list in insertion order.
pub fn encode_params<'a, I>(pairs: I) -> Result<Bytes, CodecError>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut out = BytesMut::new();
    for (name, value) in pairs {
        write_len(&mut out, name.len())?;
        write_len(&mut out, value.len())?;
        out.put_slice(name);
        out.put_slice(value);
    }
    Ok(out.freeze())
}

/// Decode a parameter list, preserving order and duplicate names.
pub fn decode_params(body: &Bytes) -> Result<Vec<(Bytes, Bytes)>, CodecError> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let name_len = read_len(body, &mut pos)?;
        let value_len = read_len(body, &mut pos)?;
        let needed = name_len + value_len;
        if body.len() < pos + needed {
            return Err(CodecError::TruncatedParams {
                needed,
                available: body.len() - pos,
            });
        }
        let name = body.slice(pos..pos + name_len);
        pos += name_len;
        let value = body.slice(pos..pos + value_len);
        pos += value_len;
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn decode_begin_request(body: &Bytes) -> Result<RecordBody, CodecError> {
    if body.len() < 8 {
        return Err(CodecError::TruncatedBody {
            kind: RecordType::BeginRequest,
            len: body.len(),
        });
    }
    let raw_role = u16::from_be_bytes([body[0], body[1]]);
    let role = Role::from_u16(raw_role).ok_or(CodecError::UnknownRole(raw_role))?;
    Ok(RecordBody::BeginRequest {
        role,
        keep_connection: body[2] & 1 == 1,
    })
}

fn decode_end_request(body: &Bytes) -> Result<RecordBody, CodecError> {
    if body.len() < 8 {
        return Err(CodecError::TruncatedBody {
            kind: RecordType::EndRequest,
            len: body.len(),
        });
    }
    let app_status = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let protocol_status =
        ProtocolStatus::from_u8(body[4]).ok_or(CodecError::UnknownProtocolStatus(body[4]))?;
    Ok(RecordBody::EndRequest {
        app_status,
        protocol_status,
    })
}

/// Decode a framed record body according to its header's type byte.
pub fn decode_record(header: &RecordHeader, body: Bytes) -> Result<Record, CodecError> {
    let record_body = match RecordType::from_u8(header.kind) {
        Some(RecordType::BeginRequest) => decode_begin_request(&body)?,
        Some(RecordType::AbortRequest) => RecordBody::AbortRequest,
        Some(RecordType::EndRequest) => decode_end_request(&body)?,
        Some(RecordType::Params) => RecordBody::Params(decode_params(&body)?),
        Some(RecordType::Stdin) => RecordBody::Stdin(body),
        Some(RecordType::Stdout) => RecordBody::Stdout(body),
        Some(RecordType::Stderr) => RecordBody::Stderr(body),
        Some(RecordType::Data) => RecordBody::Data(body),
        Some(RecordType::GetValues) => {
            let names = decode_params(&body)?.into_iter().map(|(name, _)| name).collect();
            RecordBody::GetValues(names)
        }
        Some(RecordType::GetValuesResult) => RecordBody::GetValuesResult(decode_params(&body)?),
        None => RecordBody::UnknownType {
            kind: header.kind,
            body,
        },
    };
    Ok(Record {
        request_id: header.request_id,
        body: record_body,
    })
}

/// Interpret a get-values result value: numeric when it parses, string
/// otherwise. Applied uniformly to every variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Num(i64),
    Str(String),
}

pub fn num_or_str(value: &[u8]) -> ValueKind {
    let text = String::from_utf8_lossy(value);
    match text.trim().parse::<i64>() {
        Ok(n) => ValueKind::Num(n),
        Err(_) => ValueKind::Str(text.into_owned()),
    }
}
