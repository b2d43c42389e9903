//! Binary wire encoding of control messages.
//!
//! Frames are a 4-byte big-endian length followed by the payload; the
//! length is validated against [`MAX_FRAME_SIZE`] before any allocation.
//! A payload is a 1-byte message kind, the 8-byte big-endian session id,
//! then kind-specific fields:
//!
//! - strings are a `u32` big-endian length followed by UTF-8 bytes;
//! - optional fields are a presence byte (0 or 1) followed by the value;
//! - digests are 32 raw bytes;
//! - serials are `u64` big-endian, statuses `u32` big-endian;
//! - booleans are one byte, 0 or 1.
//!
//! Body streams never appear in a payload. The descriptor for a fetched
//! body travels as `SCM_RIGHTS` ancillary data alongside its `HttpBody`
//! frame and is matched to it FIFO by the transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::types::{Digest, FileAction, RepositoryState, SessionId};

use super::Report;

/// Upper bound on one frame's payload.
///
/// Bounds a single decoded object plus its URI; repository objects are
/// orders of magnitude smaller in practice.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Errors from encoding or decoding wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A frame length exceeded the protocol limit.
    #[error("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge { size: usize },

    /// The payload ended inside a field.
    #[error("frame ended before the `{field}` field was complete")]
    Truncated { field: &'static str },

    /// The kind byte does not name a message.
    #[error("unknown message kind {kind}")]
    UnknownKind { kind: u8 },

    /// A field value is outside its domain.
    #[error("invalid `{field}` field")]
    BadValue { field: &'static str },

    /// Bytes were left over after the last field.
    #[error("{0} trailing bytes after the message")]
    Trailing(usize),
}

/// A parent request as it appears on the wire, without the body stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestHeader {
    Start {
        id: SessionId,
        local_path: String,
        notify_uri: String,
        state: RepositoryState,
    },
    HttpBody {
        id: SessionId,
    },
    HttpDone {
        id: SessionId,
        status: u16,
        last_modified: Option<String>,
    },
    FileAck {
        id: SessionId,
        ok: bool,
    },
}

const KIND_START: u8 = 1;
const KIND_HTTP_BODY: u8 = 2;
const KIND_HTTP_DONE: u8 = 3;
const KIND_FILE_ACK: u8 = 4;
const KIND_HTTP_REQUEST: u8 = 5;
const KIND_FILE: u8 = 6;
const KIND_STATE: u8 = 7;
const KIND_END: u8 = 8;

/// Pops one complete frame off the front of `buf`, if present.
///
/// Returns `Ok(None)` when more bytes are needed. The declared length is
/// checked against [`MAX_FRAME_SIZE`] before any buffer growth.
pub fn extract_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: length });
    }
    if buf.len() < HEADER_LEN + length {
        buf.reserve(HEADER_LEN + length - buf.len());
        return Ok(None);
    }
    buf.advance(HEADER_LEN);
    Ok(Some(buf.split_to(length).freeze()))
}

/// Encodes one worker report as a complete frame.
pub fn encode_report(report: &Report) -> Result<Bytes, WireError> {
    let mut payload = BytesMut::with_capacity(64);
    match report {
        Report::HttpRequest {
            id,
            uri,
            if_modified_since,
        } => {
            put_header(&mut payload, KIND_HTTP_REQUEST, *id);
            put_string(&mut payload, uri);
            put_opt_string(&mut payload, if_modified_since.as_deref());
        }
        Report::File {
            id,
            action,
            uri,
            hash,
            data,
        } => {
            put_header(&mut payload, KIND_FILE, *id);
            payload.put_u8(match action {
                FileAction::Add => 1,
                FileAction::Update => 2,
                FileAction::Withdraw => 3,
            });
            match hash {
                Some(digest) => {
                    payload.put_u8(1);
                    payload.put_slice(digest.as_bytes());
                }
                None => payload.put_u8(0),
            }
            put_string(&mut payload, uri);
            match data {
                Some(data) => {
                    payload.put_u8(1);
                    payload.put_u32(data.len() as u32);
                    payload.put_slice(data);
                }
                None => payload.put_u8(0),
            }
        }
        Report::State { id, state } => {
            put_header(&mut payload, KIND_STATE, *id);
            put_string(&mut payload, &state.session_id);
            payload.put_u64(state.serial);
            put_opt_string(&mut payload, state.last_modified.as_deref());
        }
        Report::End { id, ok } => {
            put_header(&mut payload, KIND_END, *id);
            payload.put_u8(u8::from(*ok));
        }
    }
    frame(payload)
}

/// Encodes one parent request header as a complete frame.
pub fn encode_request(request: &RequestHeader) -> Result<Bytes, WireError> {
    let mut payload = BytesMut::with_capacity(64);
    match request {
        RequestHeader::Start {
            id,
            local_path,
            notify_uri,
            state,
        } => {
            put_header(&mut payload, KIND_START, *id);
            put_string(&mut payload, local_path);
            put_string(&mut payload, notify_uri);
            put_string(&mut payload, &state.session_id);
            payload.put_u64(state.serial);
            put_opt_string(&mut payload, state.last_modified.as_deref());
        }
        RequestHeader::HttpBody { id } => {
            put_header(&mut payload, KIND_HTTP_BODY, *id);
        }
        RequestHeader::HttpDone {
            id,
            status,
            last_modified,
        } => {
            put_header(&mut payload, KIND_HTTP_DONE, *id);
            payload.put_u32(u32::from(*status));
            put_opt_string(&mut payload, last_modified.as_deref());
        }
        RequestHeader::FileAck { id, ok } => {
            put_header(&mut payload, KIND_FILE_ACK, *id);
            payload.put_u8(u8::from(*ok));
        }
    }
    frame(payload)
}

/// Decodes one parent request header from a frame payload.
pub fn decode_request(mut payload: Bytes) -> Result<RequestHeader, WireError> {
    let kind = take_u8(&mut payload, "kind")?;
    let id = SessionId(take_u64(&mut payload, "session id")?);
    let request = match kind {
        KIND_START => {
            let local_path = take_string(&mut payload, "local path")?;
            let notify_uri = take_string(&mut payload, "notify uri")?;
            let session_id = take_string(&mut payload, "session id")?;
            let serial = take_u64(&mut payload, "serial")?;
            let last_modified = take_opt_string(&mut payload, "last modified")?;
            RequestHeader::Start {
                id,
                local_path,
                notify_uri,
                state: RepositoryState {
                    session_id,
                    serial,
                    last_modified,
                },
            }
        }
        KIND_HTTP_BODY => RequestHeader::HttpBody { id },
        KIND_HTTP_DONE => {
            let status = take_u32(&mut payload, "status")?;
            let status = u16::try_from(status).map_err(|_| WireError::BadValue {
                field: "status",
            })?;
            let last_modified = take_opt_string(&mut payload, "last modified")?;
            RequestHeader::HttpDone {
                id,
                status,
                last_modified,
            }
        }
        KIND_FILE_ACK => RequestHeader::FileAck {
            id,
            ok: take_bool(&mut payload, "ok")?,
        },
        kind => return Err(WireError::UnknownKind { kind }),
    };
    finish(payload)?;
    Ok(request)
}

/// Decodes one worker report from a frame payload.
pub fn decode_report(mut payload: Bytes) -> Result<Report, WireError> {
    let kind = take_u8(&mut payload, "kind")?;
    let id = SessionId(take_u64(&mut payload, "session id")?);
    let report = match kind {
        KIND_HTTP_REQUEST => {
            let uri = take_string(&mut payload, "uri")?;
            let if_modified_since = take_opt_string(&mut payload, "if modified since")?;
            Report::HttpRequest {
                id,
                uri,
                if_modified_since,
            }
        }
        KIND_FILE => {
            let action = match take_u8(&mut payload, "action")? {
                1 => FileAction::Add,
                2 => FileAction::Update,
                3 => FileAction::Withdraw,
                _ => return Err(WireError::BadValue { field: "action" }),
            };
            let hash = if take_bool(&mut payload, "hash presence")? {
                Some(Digest::from(take_digest(&mut payload, "hash")?))
            } else {
                None
            };
            let uri = take_string(&mut payload, "uri")?;
            let data = if take_bool(&mut payload, "data presence")? {
                let length = take_u32(&mut payload, "data length")? as usize;
                Some(take_bytes(&mut payload, length, "data")?)
            } else {
                None
            };
            Report::File {
                id,
                action,
                uri,
                hash,
                data,
            }
        }
        KIND_STATE => {
            let session_id = take_string(&mut payload, "session id")?;
            let serial = take_u64(&mut payload, "serial")?;
            let last_modified = take_opt_string(&mut payload, "last modified")?;
            Report::State {
                id,
                state: RepositoryState {
                    session_id,
                    serial,
                    last_modified,
                },
            }
        }
        KIND_END => Report::End {
            id,
            ok: take_bool(&mut payload, "ok")?,
        },
        kind => return Err(WireError::UnknownKind { kind }),
    };
    finish(payload)?;
    Ok(report)
}

fn frame(payload: BytesMut) -> Result<Bytes, WireError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
        });
    }
    let mut framed = BytesMut::with_capacity(HEADER_LEN + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.extend_from_slice(&payload);
    Ok(framed.freeze())
}

fn put_header(payload: &mut BytesMut, kind: u8, id: SessionId) {
    payload.put_u8(kind);
    payload.put_u64(id.0);
}

fn put_string(payload: &mut BytesMut, value: &str) {
    payload.put_u32(value.len() as u32);
    payload.put_slice(value.as_bytes());
}

fn put_opt_string(payload: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            payload.put_u8(1);
            put_string(payload, value);
        }
        None => payload.put_u8(0),
    }
}

fn finish(payload: Bytes) -> Result<(), WireError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(WireError::Trailing(payload.len()))
    }
}

fn take_u8(payload: &mut Bytes, field: &'static str) -> Result<u8, WireError> {
    if payload.remaining() < 1 {
        return Err(WireError::Truncated { field });
    }
    Ok(payload.get_u8())
}

fn take_u32(payload: &mut Bytes, field: &'static str) -> Result<u32, WireError> {
    if payload.remaining() < 4 {
        return Err(WireError::Truncated { field });
    }
    Ok(payload.get_u32())
}

fn take_u64(payload: &mut Bytes, field: &'static str) -> Result<u64, WireError> {
    if payload.remaining() < 8 {
        return Err(WireError::Truncated { field });
    }
    Ok(payload.get_u64())
}

fn take_bool(payload: &mut Bytes, field: &'static str) -> Result<bool, WireError> {
    match take_u8(payload, field)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(WireError::BadValue { field }),
    }
}

fn take_bytes(payload: &mut Bytes, length: usize, field: &'static str) -> Result<Vec<u8>, WireError> {
    if payload.remaining() < length {
        return Err(WireError::Truncated { field });
    }
    let mut out = vec![0u8; length];
    payload.copy_to_slice(&mut out);
    Ok(out)
}

fn take_digest(payload: &mut Bytes, field: &'static str) -> Result<[u8; 32], WireError> {
    if payload.remaining() < 32 {
        return Err(WireError::Truncated { field });
    }
    let mut out = [0u8; 32];
    payload.copy_to_slice(&mut out);
    Ok(out)
}

fn take_string(payload: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let length = take_u32(payload, field)? as usize;
    let raw = take_bytes(payload, length, field)?;
    String::from_utf8(raw).map_err(|_| WireError::BadValue { field })
}

fn take_opt_string(payload: &mut Bytes, field: &'static str) -> Result<Option<String>, WireError> {
    if take_bool(payload, field)? {
        Ok(Some(take_string(payload, field)?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_header(frame: Bytes) -> Bytes {
        frame.slice(HEADER_LEN..)
    }

    fn request_roundtrip(request: RequestHeader) {
        let frame = encode_request(&request).unwrap();
        let decoded = decode_request(strip_header(frame)).unwrap();
        assert_eq!(decoded, request);
    }

    fn report_roundtrip(report: Report) {
        let frame = encode_report(&report).unwrap();
        let decoded = decode_report(strip_header(frame)).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn request_roundtrips() {
        request_roundtrip(RequestHeader::Start {
            id: SessionId(7),
            local_path: "cache/host".into(),
            notify_uri: "https://host/notification.xml".into(),
            state: RepositoryState {
                session_id: "5ef9".into(),
                serial: 42,
                last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".into()),
            },
        });
        request_roundtrip(RequestHeader::Start {
            id: SessionId(0),
            local_path: String::new(),
            notify_uri: "https://host/n.xml".into(),
            state: RepositoryState::default(),
        });
        request_roundtrip(RequestHeader::HttpBody { id: SessionId(3) });
        request_roundtrip(RequestHeader::HttpDone {
            id: SessionId(3),
            status: 304,
            last_modified: None,
        });
        request_roundtrip(RequestHeader::FileAck {
            id: SessionId(u64::MAX),
            ok: false,
        });
    }

    #[test]
    fn report_roundtrips() {
        let digest = Digest::parse(&"ab".repeat(32)).unwrap();
        report_roundtrip(Report::HttpRequest {
            id: SessionId(1),
            uri: "https://host/snapshot.xml".into(),
            if_modified_since: Some("Tue, 02 Jan 2024 00:00:00 GMT".into()),
        });
        report_roundtrip(Report::File {
            id: SessionId(1),
            action: FileAction::Add,
            uri: "rsync://host/obj.cer".into(),
            hash: None,
            data: Some(b"content".to_vec()),
        });
        report_roundtrip(Report::File {
            id: SessionId(1),
            action: FileAction::Withdraw,
            uri: "rsync://host/obj.cer".into(),
            hash: Some(digest),
            data: None,
        });
        report_roundtrip(Report::State {
            id: SessionId(1),
            state: RepositoryState {
                session_id: "5ef9".into(),
                serial: 42,
                last_modified: None,
            },
        });
        report_roundtrip(Report::End {
            id: SessionId(1),
            ok: true,
        });
    }

    #[test]
    fn extract_waits_for_a_full_header() {
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert_eq!(extract_frame(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn extract_waits_for_a_full_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(&[1, 2, 3]);
        assert_eq!(extract_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn extract_rejects_oversized_frames() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            extract_frame(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn extract_pops_frames_in_order() {
        let mut buf = BytesMut::new();
        for frame in [
            encode_request(&RequestHeader::HttpBody { id: SessionId(1) }).unwrap(),
            encode_request(&RequestHeader::HttpBody { id: SessionId(2) }).unwrap(),
        ] {
            buf.extend_from_slice(&frame);
        }

        let first = extract_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            decode_request(first).unwrap(),
            RequestHeader::HttpBody { id: SessionId(1) }
        );
        let second = extract_frame(&mut buf).unwrap().unwrap();
        assert_eq!(
            decode_request(second).unwrap(),
            RequestHeader::HttpBody { id: SessionId(2) }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let frame = encode_request(&RequestHeader::HttpDone {
            id: SessionId(3),
            status: 200,
            last_modified: None,
        })
        .unwrap();
        let payload = strip_header(frame);
        let short = payload.slice(..payload.len() - 1);
        assert!(matches!(
            decode_request(short),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u8(200);
        payload.put_u64(1);
        assert!(matches!(
            decode_request(payload.freeze()),
            Err(WireError::UnknownKind { kind: 200 })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let frame = encode_request(&RequestHeader::HttpBody { id: SessionId(1) }).unwrap();
        let mut payload = BytesMut::from(&strip_header(frame)[..]);
        payload.put_u8(0);
        assert!(matches!(
            decode_request(payload.freeze()),
            Err(WireError::Trailing(1))
        ));
    }

    #[test]
    fn bad_bool_is_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u8(KIND_FILE_ACK);
        payload.put_u64(1);
        payload.put_u8(7);
        assert!(matches!(
            decode_request(payload.freeze()),
            Err(WireError::BadValue { field: "ok" })
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_start_roundtrips(
                id: u64,
                local_path in ".{0,64}",
                notify_uri in ".{0,64}",
                session_id in ".{0,64}",
                serial: u64,
                last_modified in proptest::option::of(".{0,40}"),
            ) {
                let request = RequestHeader::Start {
                    id: SessionId(id),
                    local_path,
                    notify_uri,
                    state: RepositoryState { session_id, serial, last_modified },
                };
                let frame = encode_request(&request).unwrap();
                let decoded = decode_request(frame.slice(HEADER_LEN..)).unwrap();
                prop_assert_eq!(decoded, request);
            }

            #[test]
            fn any_file_roundtrips(
                id: u64,
                uri in ".{0,64}",
                data in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..512)),
            ) {
                let report = Report::File {
                    id: SessionId(id),
                    action: FileAction::Update,
                    uri,
                    hash: Some(Digest::from([0x5au8; 32])),
                    data,
                };
                let frame = encode_report(&report).unwrap();
                let decoded = decode_report(frame.slice(HEADER_LEN..)).unwrap();
                prop_assert_eq!(decoded, report);
            }
        }
    }
}
