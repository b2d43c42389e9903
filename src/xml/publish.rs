//! Publish/withdraw record accumulation and emission.
//!
//! Snapshots and deltas both carry their object content as base64 character
//! data inside `<publish>` elements. A record is created when the element
//! opens, accumulates text while it is in scope, and is decoded and emitted
//! as one file event when it closes. Records never outlive their element:
//! any failure path drops the partial record with the handler.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;

use crate::control::Report;
use crate::types::{Digest, FileAction, SessionId};

use super::ParseError;

/// Routes decoded file events into the shared report queue.
///
/// Handlers own a sink instead of a reference back to their session; the
/// session adds the emission count to its pending-file counter once the
/// body has been consumed.
#[derive(Debug)]
pub(crate) struct FileSink {
    id: SessionId,
    reports: mpsc::UnboundedSender<Report>,
    emitted: u64,
}

impl FileSink {
    pub(crate) fn new(id: SessionId, reports: mpsc::UnboundedSender<Report>) -> Self {
        FileSink {
            id,
            reports,
            emitted: 0,
        }
    }

    /// Number of file events emitted through this sink so far.
    pub(crate) fn emitted(&self) -> u64 {
        self.emitted
    }

    fn emit(
        &mut self,
        action: FileAction,
        uri: String,
        hash: Option<Digest>,
        data: Option<Vec<u8>>,
    ) -> Result<(), ParseError> {
        self.reports
            .send(Report::File {
                id: self.id,
                action,
                uri,
                hash,
                data,
            })
            .map_err(|_| ParseError::ChannelClosed)?;
        self.emitted += 1;
        Ok(())
    }
}

/// One publish or withdraw record while its element is open.
#[derive(Debug)]
pub(crate) struct PendingPublish {
    action: FileAction,
    uri: String,
    hash: Option<Digest>,
    content: String,
}

impl PendingPublish {
    pub(crate) fn new(action: FileAction, uri: String, hash: Option<Digest>) -> Self {
        PendingPublish {
            action,
            uri,
            hash,
            content: String::new(),
        }
    }

    /// Appends a chunk of character data.
    ///
    /// A chunk that is just a newline is skipped outright; published XML
    /// wraps its base64 and this avoids growing the buffer for separators.
    pub(crate) fn push_text(&mut self, text: &str) {
        if text == "\n" {
            return;
        }
        self.content.push_str(text);
    }

    /// Decodes the accumulated content and emits the file event.
    ///
    /// Add and update records must decode to non-empty content; a withdraw
    /// must decode to nothing at all.
    pub(crate) fn finish(self, sink: &mut FileSink) -> Result<(), ParseError> {
        let data = decode_base64(&self.content)?;
        match self.action {
            FileAction::Withdraw => {
                if !data.is_empty() {
                    return Err(ParseError::WithdrawWithContent);
                }
                sink.emit(self.action, self.uri, self.hash, None)
            }
            FileAction::Add | FileAction::Update => {
                if data.is_empty() {
                    return Err(ParseError::EmptyPublish);
                }
                sink.emit(self.action, self.uri, self.hash, Some(data))
            }
        }
    }
}

/// Decodes base64 text after stripping everything outside the alphabet.
///
/// Published documents routinely wrap and indent their content, so any
/// character outside `[A-Za-z0-9+/=]` is discarded before decoding.
pub(crate) fn decode_base64(text: &str) -> Result<Vec<u8>, ParseError> {
    let stripped: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect();
    if stripped.is_empty() {
        return Ok(Vec::new());
    }
    Ok(STANDARD.decode(stripped.as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (FileSink, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FileSink::new(SessionId(9), tx), rx)
    }

    #[test]
    fn decode_strips_whitespace_and_wrapping() {
        let decoded = decode_base64("  aGVs\n  bG8g\n  d29ybGQ=\n").unwrap();
        assert_eq!(decoded, b"hello world");
    }

    #[test]
    fn decode_empty_input() {
        assert_eq!(decode_base64("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_base64(" \n\t").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_base64("a").is_err());
    }

    #[test]
    fn publish_emits_decoded_content() {
        let (mut sink, mut rx) = sink();
        let mut record = PendingPublish::new(
            FileAction::Add,
            "rsync://example.org/a.cer".into(),
            None,
        );
        record.push_text("aGVsbG8=");
        record.finish(&mut sink).unwrap();

        assert_eq!(sink.emitted(), 1);
        match rx.try_recv().unwrap() {
            Report::File {
                id,
                action,
                uri,
                hash,
                data,
            } => {
                assert_eq!(id, SessionId(9));
                assert_eq!(action, FileAction::Add);
                assert_eq!(uri, "rsync://example.org/a.cer");
                assert_eq!(hash, None);
                assert_eq!(data.unwrap(), b"hello");
            }
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[test]
    fn publish_accumulates_chunks() {
        let (mut sink, mut rx) = sink();
        let mut record =
            PendingPublish::new(FileAction::Add, "rsync://example.org/a.cer".into(), None);
        record.push_text("aGVs");
        record.push_text("\n");
        record.push_text("bG8=");
        record.finish(&mut sink).unwrap();

        match rx.try_recv().unwrap() {
            Report::File { data, .. } => assert_eq!(data.unwrap(), b"hello"),
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[test]
    fn empty_publish_is_an_error() {
        let (mut sink, _rx) = sink();
        let record =
            PendingPublish::new(FileAction::Update, "rsync://example.org/a.cer".into(), None);
        assert!(matches!(
            record.finish(&mut sink),
            Err(ParseError::EmptyPublish)
        ));
        assert_eq!(sink.emitted(), 0);
    }

    #[test]
    fn withdraw_must_be_empty() {
        let hash = Digest::parse(&"ab".repeat(32)).unwrap();
        let (mut sink, mut rx) = sink();

        let record = PendingPublish::new(
            FileAction::Withdraw,
            "rsync://example.org/a.cer".into(),
            Some(hash),
        );
        record.finish(&mut sink).unwrap();
        match rx.try_recv().unwrap() {
            Report::File { action, data, .. } => {
                assert_eq!(action, FileAction::Withdraw);
                assert_eq!(data, None);
            }
            other => panic!("unexpected report: {other:?}"),
        }

        let mut record = PendingPublish::new(
            FileAction::Withdraw,
            "rsync://example.org/a.cer".into(),
            Some(hash),
        );
        record.push_text("aGVsbG8=");
        assert!(matches!(
            record.finish(&mut sink),
            Err(ParseError::WithdrawWithContent)
        ));
    }

    #[test]
    fn bad_base64_is_an_error() {
        let (mut sink, _rx) = sink();
        let mut record =
            PendingPublish::new(FileAction::Add, "rsync://example.org/a.cer".into(), None);
        record.push_text("!!!a");
        assert!(matches!(record.finish(&mut sink), Err(ParseError::Base64(_))));
    }
}
