//! Streaming parsers for the three RRDP document types.
//!
//! Each document gets a handler with a small scope automaton: the scope only
//! ever advances along the fixed element path of its schema, and any element
//! or character data that would leave the expected scope is a fatal parse
//! error. A shared async driver feeds handler callbacks from the incremental
//! reader, so documents are validated and emitted while the body is still
//! streaming.

use quick_xml::Reader;
use quick_xml::events::Event;
use quick_xml::events::attributes::{AttrError, Attributes};
use thiserror::Error;
use tokio::io::AsyncBufRead;

use crate::types::Digest;

pub mod delta;
pub mod notification;
pub mod publish;
pub mod snapshot;

/// Highest RRDP `version` attribute this worker understands.
pub const MAX_VERSION: u8 = 1;

/// Errors raised while parsing an RRDP document.
///
/// All of these are session-local: they fail the current fetch (and trigger
/// the snapshot fallback for deltas) but never the worker.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The underlying XML was malformed or the body stream failed.
    #[error("malformed XML: {0}")]
    Syntax(#[from] quick_xml::Error),

    /// An attribute list could not be tokenized.
    #[error("malformed attribute: {0}")]
    Attribute(#[from] AttrError),

    /// Character data was not valid UTF-8.
    #[error("invalid UTF-8 in character data")]
    Utf8(#[from] std::str::Utf8Error),

    /// An element opened outside its allowed scope.
    #[error("unexpected element <{element}>")]
    UnexpectedElement { element: String },

    /// An element closed outside its allowed scope.
    #[error("unexpected end of element </{element}>")]
    UnexpectedEnd { element: String },

    /// Non-whitespace character data outside a publish or withdraw element.
    #[error("unexpected character data")]
    UnexpectedText,

    /// A required attribute was absent.
    #[error("<{element}> is missing required attribute `{attribute}`")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    /// An attribute the schema does not define was present.
    #[error("<{element}> carries unsupported attribute `{attribute}`")]
    UnknownAttribute {
        element: &'static str,
        attribute: String,
    },

    /// An attribute value failed validation.
    #[error("<{element}> has malformed `{attribute}` attribute: {value}")]
    BadAttribute {
        element: &'static str,
        attribute: &'static str,
        value: String,
    },

    /// Two delta entries advertised the same serial.
    #[error("duplicate delta serial {serial}")]
    DuplicateDelta { serial: u64 },

    /// A snapshot or delta named a session other than the notification's.
    #[error("session_id {found:?} does not match notification session_id {expected:?}")]
    SessionMismatch { expected: String, found: String },

    /// A snapshot or delta named an unexpected serial.
    #[error("serial {found} does not match expected serial {expected}")]
    SerialMismatch { expected: u64, found: u64 },

    /// A snapshot or delta version differs from the notification version.
    #[error("version {found} does not match notification version {expected}")]
    VersionMismatch { expected: u8, found: u8 },

    /// A publish element decoded to no content.
    #[error("publish element carries no content")]
    EmptyPublish,

    /// A withdraw element decoded to non-empty content.
    #[error("withdraw element carries content")]
    WithdrawWithContent,

    /// Publish content did not decode as base64.
    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The body ended before the document was complete.
    #[error("document ended in an incomplete state")]
    Truncated,

    /// The outgoing report queue vanished while emitting a file event.
    #[error("control channel closed while emitting file events")]
    ChannelClosed,
}

/// Callbacks one document handler receives from the driver.
pub(crate) trait ElementHandler {
    fn on_start(&mut self, element: &[u8], attrs: Attributes<'_>) -> Result<(), ParseError>;

    fn on_text(&mut self, text: &str) -> Result<(), ParseError>;

    fn on_end(&mut self, element: &[u8]) -> Result<(), ParseError>;
}

/// Feeds parser events into a handler until end of input.
///
/// Empty elements are delivered as a start immediately followed by the
/// matching end, so handlers only ever deal with one element shape.
/// Declarations, comments, and processing instructions are skipped.
pub(crate) async fn drive<R, H>(reader: &mut Reader<R>, handler: &mut H) -> Result<(), ParseError>
where
    R: AsyncBufRead + Unpin,
    H: ElementHandler,
{
    let mut buf = Vec::with_capacity(4 * 1024);
    loop {
        match reader.read_event_into_async(&mut buf).await? {
            Event::Start(start) => {
                let name = start.name();
                handler.on_start(name.as_ref(), start.attributes())?;
            }
            Event::Empty(start) => {
                let name = start.name();
                handler.on_start(name.as_ref(), start.attributes())?;
                handler.on_end(name.as_ref())?;
            }
            Event::End(end) => handler.on_end(end.name().as_ref())?,
            Event::Text(text) => handler.on_text(&text.unescape()?)?,
            Event::CData(data) => handler.on_text(std::str::from_utf8(&data)?)?,
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => return Ok(()),
        }
        buf.clear();
    }
}

/// Root attributes a snapshot or delta must repeat from the notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocExpect {
    pub version: u8,
    pub session_id: String,
    pub serial: u64,
}

/// Validates the root element of a snapshot or delta against the
/// notification it was advertised in. All four attributes are required;
/// any disagreement with the notification is fatal.
pub(crate) fn check_root_attrs(
    element: &'static str,
    attrs: Attributes<'_>,
    expect: &DocExpect,
) -> Result<(), ParseError> {
    let mut has_xmlns = false;
    let mut version = None;
    let mut session_id = None;
    let mut serial = None;

    for attr in attrs {
        let attr = attr?;
        match attr.key.as_ref() {
            b"xmlns" => has_xmlns = true,
            b"version" => version = Some(parse_version(element, &attr.unescape_value()?)?),
            b"session_id" => session_id = Some(attr.unescape_value()?.into_owned()),
            b"serial" => serial = Some(parse_serial(element, &attr.unescape_value()?)?),
            other => {
                return Err(unknown_attribute(element, other));
            }
        }
    }

    if !has_xmlns {
        return Err(ParseError::MissingAttribute {
            element,
            attribute: "xmlns",
        });
    }
    let version = version.ok_or(ParseError::MissingAttribute {
        element,
        attribute: "version",
    })?;
    let session_id = session_id.ok_or(ParseError::MissingAttribute {
        element,
        attribute: "session_id",
    })?;
    let serial = serial.ok_or(ParseError::MissingAttribute {
        element,
        attribute: "serial",
    })?;

    if version != expect.version {
        return Err(ParseError::VersionMismatch {
            expected: expect.version,
            found: version,
        });
    }
    if session_id != expect.session_id {
        return Err(ParseError::SessionMismatch {
            expected: expect.session_id.clone(),
            found: session_id,
        });
    }
    if serial != expect.serial {
        return Err(ParseError::SerialMismatch {
            expected: expect.serial,
            found: serial,
        });
    }
    Ok(())
}

/// Parses a serial attribute into `[1, i64::MAX]`.
pub(crate) fn parse_serial(element: &'static str, value: &str) -> Result<u64, ParseError> {
    match value.parse::<u64>() {
        Ok(serial) if (1..=i64::MAX as u64).contains(&serial) => Ok(serial),
        _ => Err(ParseError::BadAttribute {
            element,
            attribute: "serial",
            value: value.to_owned(),
        }),
    }
}

/// Parses a version attribute into `[1, MAX_VERSION]`.
pub(crate) fn parse_version(element: &'static str, value: &str) -> Result<u8, ParseError> {
    match value.parse::<u8>() {
        Ok(version) if (1..=MAX_VERSION).contains(&version) => Ok(version),
        _ => Err(ParseError::BadAttribute {
            element,
            attribute: "version",
            value: value.to_owned(),
        }),
    }
}

/// Parses a hash attribute into a digest.
pub(crate) fn parse_hash(element: &'static str, value: &str) -> Result<Digest, ParseError> {
    Digest::parse(value).map_err(|_| ParseError::BadAttribute {
        element,
        attribute: "hash",
        value: value.to_owned(),
    })
}

pub(crate) fn unknown_attribute(element: &'static str, attribute: &[u8]) -> ParseError {
    ParseError::UnknownAttribute {
        element,
        attribute: String::from_utf8_lossy(attribute).into_owned(),
    }
}

pub(crate) fn unexpected_element(element: &[u8]) -> ParseError {
    ParseError::UnexpectedElement {
        element: String::from_utf8_lossy(element).into_owned(),
    }
}

pub(crate) fn unexpected_end(element: &[u8]) -> ParseError {
    ParseError::UnexpectedEnd {
        element: String::from_utf8_lossy(element).into_owned(),
    }
}

/// Character data outside publish/withdraw content must be whitespace.
pub(crate) fn require_whitespace(text: &str) -> Result<(), ParseError> {
    if text.chars().all(char::is_whitespace) {
        Ok(())
    } else {
        Err(ParseError::UnexpectedText)
    }
}

/// Runs a handler over a complete in-memory document. Test use only.
#[cfg(test)]
pub(crate) async fn parse_bytes<H: ElementHandler>(
    doc: &[u8],
    handler: &mut H,
) -> Result<(), ParseError> {
    let mut reader = Reader::from_reader(doc);
    drive(&mut reader, handler).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_bounds() {
        assert_eq!(parse_serial("delta", "1").unwrap(), 1);
        assert_eq!(
            parse_serial("delta", &i64::MAX.to_string()).unwrap(),
            i64::MAX as u64
        );
        assert!(parse_serial("delta", "0").is_err());
        assert!(parse_serial("delta", "-4").is_err());
        assert!(parse_serial("delta", "9223372036854775808").is_err());
        assert!(parse_serial("delta", "twelve").is_err());
    }

    #[test]
    fn version_bounds() {
        assert_eq!(parse_version("snapshot", "1").unwrap(), 1);
        assert!(parse_version("snapshot", "0").is_err());
        assert!(parse_version("snapshot", "2").is_err());
        assert!(parse_version("snapshot", "one").is_err());
    }

    #[test]
    fn whitespace_text() {
        assert!(require_whitespace(" \n\t ").is_ok());
        assert!(require_whitespace("").is_ok());
        assert!(require_whitespace(" x ").is_err());
    }
}
