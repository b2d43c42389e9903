//! The delta document: one serial step of publishes and withdraws.

use quick_xml::events::attributes::Attributes;

use crate::types::FileAction;

use super::publish::{FileSink, PendingPublish};
use super::{
    DocExpect, ElementHandler, ParseError, check_root_attrs, parse_hash, require_whitespace,
    unexpected_element, unexpected_end, unknown_attribute,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Start,
    Delta,
    Publish,
    Withdraw,
    End,
}

/// Streaming handler for the delta schema.
///
/// A `<publish>` with a `hash` attribute updates an existing object and
/// without one adds a new object; a `<withdraw>` always names the digest of
/// the object it removes.
pub(crate) struct DeltaHandler {
    scope: Scope,
    expect: DocExpect,
    pending: Option<PendingPublish>,
    sink: FileSink,
}

impl DeltaHandler {
    pub(crate) fn new(expect: DocExpect, sink: FileSink) -> Self {
        DeltaHandler {
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
        let mut hash = None;
        for attr in attrs {
            let attr = attr?;
            match attr.key.as_ref() {
                b"uri" => uri = Some(attr.unescape_value()?.into_owned()),
                b"hash" => hash = Some(parse_hash("publish", &attr.unescape_value()?)?),
                other => return Err(unknown_attribute("publish", other)),
            }
        }
        let uri = uri.ok_or(ParseError::MissingAttribute {
            element: "publish",
            attribute: "uri",
        })?;

        let action = if hash.is_some() {
            FileAction::Update
        } else {
            FileAction::Add
        };
        self.pending = Some(PendingPublish::new(action, uri, hash));
        self.scope = Scope::Publish;
        Ok(())
    }

    fn start_withdraw(&mut self, attrs: Attributes<'_>) -> Result<(), ParseError> {
        let mut uri = None;
        let mut hash = None;
        for attr in attrs {
            let attr = attr?;
            match attr.key.as_ref() {
                b"uri" => uri = Some(attr.unescape_value()?.into_owned()),
                b"hash" => hash = Some(parse_hash("withdraw", &attr.unescape_value()?)?),
                other => return Err(unknown_attribute("withdraw", other)),
            }
        }
        let uri = uri.ok_or(ParseError::MissingAttribute {
            element: "withdraw",
            attribute: "uri",
        })?;
        let hash = hash.ok_or(ParseError::MissingAttribute {
            element: "withdraw",
            attribute: "hash",
        })?;

        self.pending = Some(PendingPublish::new(FileAction::Withdraw, uri, Some(hash)));
        self.scope = Scope::Withdraw;
        Ok(())
    }

    fn end_record(&mut self, next: Scope) -> Result<(), ParseError> {
        let record = self.pending.take().ok_or(ParseError::Truncated)?;
        record.finish(&mut self.sink)?;
        self.scope = next;
        Ok(())
    }
}

impl ElementHandler for DeltaHandler {
    fn on_start(&mut self, element: &[u8], attrs: Attributes<'_>) -> Result<(), ParseError> {
        match element {
            b"delta" if self.scope == Scope::Start => {
                check_root_attrs("delta", attrs, &self.expect)?;
                self.scope = Scope::Delta;
                Ok(())
            }
            b"publish" if self.scope == Scope::Delta => self.start_publish(attrs),
            b"withdraw" if self.scope == Scope::Delta => self.start_withdraw(attrs),
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
            b"publish" if self.scope == Scope::Publish => self.end_record(Scope::Delta),
            b"withdraw" if self.scope == Scope::Withdraw => self.end_record(Scope::Delta),
            b"delta" if self.scope == Scope::Delta => {
                self.scope = Scope::End;
                Ok(())
            }
            other => Err(unexpected_end(other)),
        }
    }
}
