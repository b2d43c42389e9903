//! The snapshot document: every current object as a `<publish>` entry.

use quick_xml::events::attributes::Attributes;

use crate::types::FileAction;

use super::publish::{FileSink, PendingPublish};
use super::{
    DocExpect, ElementHandler, ParseError, check_root_attrs, require_whitespace,
    unexpected_element, unexpected_end, unknown_attribute,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Start,
    Snapshot,
    Publish,
    End,
}

/// Streaming handler for the snapshot schema.
///
/// Every publish record is emitted as an add; snapshots replace the whole
/// repository, so no expected on-disk digest ever applies.
pub(crate) struct SnapshotHandler {
    scope: Scope,
    expect: DocExpect,
    pending: Option<PendingPublish>,
    sink: FileSink,
}

impl SnapshotHandler {
    pub(crate) fn new(expect: DocExpect, sink: FileSink) -> Self {
        SnapshotHandler {
            scope: Scope::Start,
            expect,
            pending: None,
            sink,
        }
    }

    /// Number of file events emitted while parsing.
    pub(crate) fn emitted(&self) -> u64 {
        self.sink.emitted()
    }

    /// Verifies the document was closed.
    pub(crate) fn finish(&self) -> Result<(), ParseError> {
        if self.scope != Scope::End {
            return Err(ParseError::Truncated);
        }
        Ok(())
    }

    fn start_publish(&mut self, attrs: Attributes<'_>) -> Result<(), ParseError> {
        let mut uri = None;
        for attr in attrs {
            let attr = attr?;
            match attr.key.as_ref() {
                b"uri" => uri = Some(attr.unescape_value()?.into_owned()),
                other => return Err(unknown_attribute("publish", other)),
            }
        }
        let uri = uri.ok_or(ParseError::MissingAttribute {
            element: "publish",
            attribute: "uri",
        })?;

        self.pending = Some(PendingPublish::new(FileAction::Add, uri, None));
        self.scope = Scope::Publish;
        Ok(())
    }
}

impl ElementHandler for SnapshotHandler {
    fn on_start(&mut self, element: &[u8], attrs: Attributes<'_>) -> Result<(), ParseError> {
        match element {
            b"snapshot" if self.scope == Scope::Start => {
                check_root_attrs("snapshot", attrs, &self.expect)?;
                self.scope = Scope::Snapshot;
                Ok(())
            }
            b"publish" if self.scope == Scope::Snapshot => self.start_publish(attrs),
            other => Err(unexpected_element(other)),
        }
    }

    fn on_text(&mut self, text: &str) -> Result<(), ParseError> {
        match &mut self.pending {
            Some(record) => {
                record.push_text(text);
                Ok(())
            }
            None => require_whitespace(text),
        }
    }

    fn on_end(&mut self, element: &[u8]) -> Result<(), ParseError> {
        match element {
            b"publish" if self.scope == Scope::Publish => {
                let record = self.pending.take().ok_or(ParseError::Truncated)?;
                record.finish(&mut self.sink)?;
                self.scope = Scope::Snapshot;
                Ok(())
            }
            b"snapshot" if self.scope == Scope::Snapshot => {
                self.scope = Scope::End;
                Ok(())
            }
            other => Err(unexpected_end(other)),
        }
    }
}
