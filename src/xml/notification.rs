//! The notification document: session header, snapshot pointer, delta list.
//!
//! Parsing and planning are interleaved the way the sync needs them: the
//! plan is computed once when the `<notification>` element opens (so a
//! session-changed or up-to-date repository is recognized before the delta
//! list arrives) and once more when it closes, when the delta list is
//! complete enough to commit to a contiguous chain.

use quick_xml::events::attributes::Attributes;

use crate::types::{Digest, RepositoryState};

use super::{
    ElementHandler, ParseError, parse_hash, parse_serial, parse_version, require_whitespace,
    unexpected_element, unexpected_end, unknown_attribute,
};

/// Where the scope automaton is within the document.
///
/// The ordering is load-bearing: the plan walks the delta list only once
/// the scope has advanced past `Delta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Scope {
    Start,
    Notification,
    Snapshot,
    PostSnapshot,
    Delta,
    End,
}

/// The action a notification implies for the stored repository state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Plan {
    /// Bootstrap or resync from the full snapshot.
    #[default]
    Snapshot,
    /// Apply the advertised delta chain.
    Deltas,
    /// The stored state already matches the notification.
    UpToDate,
    /// The notification cannot be reconciled with the stored state.
    Invalid,
}

/// One `<delta>` entry of the notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRef {
    pub serial: u64,
    pub uri: String,
    pub hash: Digest,
}

/// A fully parsed and validated notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub version: u8,
    pub session_id: String,
    pub serial: u64,
    pub snapshot_uri: String,
    pub snapshot_hash: Digest,
    /// Deltas newer than the stored serial, ordered by ascending serial.
    pub deltas: Vec<DeltaRef>,
    pub plan: Plan,
}

/// Streaming handler for the notification schema.
pub(crate) struct NotificationHandler {
    prior: RepositoryState,
    scope: Scope,
    plan: Plan,
    version: Option<u8>,
    session_id: Option<String>,
    serial: Option<u64>,
    snapshot_uri: Option<String>,
    snapshot_hash: Option<Digest>,
    deltas: Vec<DeltaRef>,
}

impl NotificationHandler {
    pub(crate) fn new(prior: &RepositoryState) -> Self {
        NotificationHandler {
            prior: prior.clone(),
            scope: Scope::Start,
            plan: Plan::default(),
            version: None,
            session_id: None,
            serial: None,
            snapshot_uri: None,
            snapshot_hash: None,
            deltas: Vec::new(),
        }
    }

    /// Consumes the handler once parsing ended, yielding the document.
    pub(crate) fn finish(self) -> Result<Notification, ParseError> {
        if self.scope != Scope::End {
            return Err(ParseError::Truncated);
        }
        // The end scope is only reachable with the header and snapshot
        // attributes accepted, so these cannot be absent.
        Ok(Notification {
            version: self.version.ok_or(ParseError::Truncated)?,
            session_id: self.session_id.ok_or(ParseError::Truncated)?,
            serial: self.serial.ok_or(ParseError::Truncated)?,
            snapshot_uri: self.snapshot_uri.ok_or(ParseError::Truncated)?,
            snapshot_hash: self.snapshot_hash.ok_or(ParseError::Truncated)?,
            deltas: self.deltas,
            plan: self.plan,
        })
    }

    /// Recomputes the plan from the stored state and what has been parsed.
    ///
    /// `UpToDate` and `Invalid` are sticky once reached. While the delta
    /// list may still grow (scope has not passed `Delta`) the walk over it
    /// is deferred to the end-of-document recomputation.
    fn check_state(&mut self) {
        if matches!(self.plan, Plan::UpToDate | Plan::Invalid) {
            return;
        }

        if self.prior.is_empty() {
            self.plan = Plan::Snapshot;
            return;
        }

        let (session_id, serial) = match (&self.session_id, self.serial) {
            (Some(session_id), Some(serial)) => (session_id, serial),
            _ => {
                self.plan = Plan::Invalid;
                return;
            }
        };

        if self.prior.session_id != *session_id {
            self.plan = Plan::Snapshot;
            return;
        }

        if serial == self.prior.serial {
            self.plan = Plan::UpToDate;
            return;
        }
        if serial < self.prior.serial {
            self.plan = Plan::Invalid;
            return;
        }

        if self.scope <= Scope::Delta {
            return;
        }

        for (index, delta) in self.deltas.iter().enumerate() {
            if delta.serial != self.prior.serial + 1 + index as u64 {
                self.plan = Plan::Snapshot;
                return;
            }
        }
        if self.deltas.len() as u64 != serial - self.prior.serial {
            self.plan = Plan::Snapshot;
            return;
        }
        self.plan = Plan::Deltas;
    }

    /// Inserts a delta keeping the list sorted by serial.
    fn add_delta(&mut self, delta: DeltaRef) -> Result<(), ParseError> {
        match self
            .deltas
            .binary_search_by_key(&delta.serial, |d| d.serial)
        {
            Ok(_) => Err(ParseError::DuplicateDelta {
                serial: delta.serial,
            }),
            Err(position) => {
                self.deltas.insert(position, delta);
                Ok(())
            }
        }
    }

    fn start_notification(&mut self, attrs: Attributes<'_>) -> Result<(), ParseError> {
        if self.scope != Scope::Start {
            return Err(unexpected_element(b"notification"));
        }

        let mut has_xmlns = false;
        for attr in attrs {
            let attr = attr?;
            match attr.key.as_ref() {
                b"xmlns" => has_xmlns = true,
                b"version" => {
                    self.version = Some(parse_version("notification", &attr.unescape_value()?)?);
                }
                b"session_id" => {
                    self.session_id = Some(attr.unescape_value()?.into_owned());
                }
                b"serial" => {
                    self.serial = Some(parse_serial("notification", &attr.unescape_value()?)?);
                }
                other => return Err(unknown_attribute("notification", other)),
            }
        }

        if !has_xmlns {
            return Err(ParseError::MissingAttribute {
                element: "notification",
                attribute: "xmlns",
            });
        }
        if self.version.is_none() {
            return Err(ParseError::MissingAttribute {
                element: "notification",
                attribute: "version",
            });
        }
        if self.session_id.is_none() {
            return Err(ParseError::MissingAttribute {
                element: "notification",
                attribute: "session_id",
            });
        }
        if self.serial.is_none() {
            return Err(ParseError::MissingAttribute {
                element: "notification",
                attribute: "serial",
            });
        }

        self.check_state();
        self.scope = Scope::Notification;
        Ok(())
    }

    fn start_snapshot(&mut self, attrs: Attributes<'_>) -> Result<(), ParseError> {
        if self.scope != Scope::Notification {
            return Err(unexpected_element(b"snapshot"));
        }

        for attr in attrs {
            let attr = attr?;
            match attr.key.as_ref() {
                b"uri" => self.snapshot_uri = Some(attr.unescape_value()?.into_owned()),
                b"hash" => {
                    self.snapshot_hash = Some(parse_hash("snapshot", &attr.unescape_value()?)?);
                }
                other => return Err(unknown_attribute("snapshot", other)),
            }
        }

        if self.snapshot_uri.is_none() {
            return Err(ParseError::MissingAttribute {
                element: "snapshot",
                attribute: "uri",
            });
        }
        if self.snapshot_hash.is_none() {
            return Err(ParseError::MissingAttribute {
                element: "snapshot",
                attribute: "hash",
            });
        }

        self.scope = Scope::Snapshot;
        Ok(())
    }

    fn start_delta(&mut self, attrs: Attributes<'_>) -> Result<(), ParseError> {
        if self.scope != Scope::PostSnapshot {
            return Err(unexpected_element(b"delta"));
        }

        let mut uri = None;
        let mut hash = None;
        let mut serial = None;
        for attr in attrs {
            let attr = attr?;
            match attr.key.as_ref() {
                b"uri" => uri = Some(attr.unescape_value()?.into_owned()),
                b"hash" => hash = Some(parse_hash("delta", &attr.unescape_value()?)?),
                b"serial" => serial = Some(parse_serial("delta", &attr.unescape_value()?)?),
                other => return Err(unknown_attribute("delta", other)),
            }
        }

        let uri = uri.ok_or(ParseError::MissingAttribute {
            element: "delta",
            attribute: "uri",
        })?;
        let hash = hash.ok_or(ParseError::MissingAttribute {
            element: "delta",
            attribute: "hash",
        })?;
        let serial = serial.ok_or(ParseError::MissingAttribute {
            element: "delta",
            attribute: "serial",
        })?;

        // Entries at or below the stored serial are already applied and
        // dropped here; without stored state every delta is irrelevant
        // because the plan is a snapshot anyway.
        if self.prior.serial != 0 && self.prior.serial < serial {
            self.add_delta(DeltaRef { serial, uri, hash })?;
        }

        self.scope = Scope::Delta;
        Ok(())
    }
}

impl ElementHandler for NotificationHandler {
    fn on_start(&mut self, element: &[u8], attrs: Attributes<'_>) -> Result<(), ParseError> {
        match element {
            b"notification" => self.start_notification(attrs),
            b"snapshot" => self.start_snapshot(attrs),
            b"delta" => self.start_delta(attrs),
            other => Err(unexpected_element(other)),
        }
    }

    fn on_text(&mut self, text: &str) -> Result<(), ParseError> {
        require_whitespace(text)
    }

    fn on_end(&mut self, element: &[u8]) -> Result<(), ParseError> {
        match element {
            b"notification" if self.scope == Scope::PostSnapshot => {
                self.scope = Scope::End;
                self.check_state();
                Ok(())
            }
            b"snapshot" if self.scope == Scope::Snapshot => {
                self.scope = Scope::PostSnapshot;
                Ok(())
            }
            b"delta" if self.scope == Scope::Delta => {
                self.scope = Scope::PostSnapshot;
                Ok(())
            }
            other => Err(unexpected_end(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_bytes;

    const NS: &str = "http://www.ripe.net/rpki/rrdp";

    fn hash_hex(fill: &str) -> String {
        fill.repeat(32)
    }

    fn prior(session_id: &str, serial: u64) -> RepositoryState {
        RepositoryState {
            session_id: session_id.to_owned(),
            serial,
            last_modified: None,
        }
    }

    fn doc(session_id: &str, serial: u64, deltas: &[(u64, &str)]) -> String {
        let mut out = format!(
            "<notification xmlns=\"{NS}\" version=\"1\" session_id=\"{session_id}\" \
             serial=\"{serial}\">\n  <snapshot uri=\"https://host/s.xml\" hash=\"{}\"/>\n",
            hash_hex("aa"),
        );
        for (delta_serial, fill) in deltas {
            out.push_str(&format!(
                "  <delta serial=\"{delta_serial}\" uri=\"https://host/{delta_serial}.xml\" \
                 hash=\"{}\"/>\n",
                hash_hex(fill),
            ));
        }
        out.push_str("</notification>\n");
        out
    }

    async fn parse(prior: &RepositoryState, doc: &str) -> Result<Notification, ParseError> {
        let mut handler = NotificationHandler::new(prior);
        parse_bytes(doc.as_bytes(), &mut handler).await?;
        handler.finish()
    }

    #[tokio::test]
    async fn bootstrap_plans_snapshot() {
        let n = parse(&RepositoryState::default(), &doc("A", 3, &[(2, "bb"), (3, "cc")]))
            .await
            .unwrap();
        assert_eq!(n.plan, Plan::Snapshot);
        // No stored serial, so the delta list is irrelevant and not kept.
        assert!(n.deltas.is_empty());
        assert_eq!(n.snapshot_uri, "https://host/s.xml");
    }

    #[tokio::test]
    async fn contiguous_deltas_plan_deltas() {
        let n = parse(&prior("A", 10), &doc("A", 12, &[(11, "bb"), (12, "cc")]))
            .await
            .unwrap();
        assert_eq!(n.plan, Plan::Deltas);
        assert_eq!(
            n.deltas.iter().map(|d| d.serial).collect::<Vec<_>>(),
            vec![11, 12]
        );
    }

    #[tokio::test]
    async fn stale_deltas_are_dropped() {
        let n = parse(
            &prior("A", 10),
            &doc("A", 11, &[(9, "bb"), (10, "cc"), (11, "dd")]),
        )
        .await
        .unwrap();
        assert_eq!(n.plan, Plan::Deltas);
        assert_eq!(
            n.deltas.iter().map(|d| d.serial).collect::<Vec<_>>(),
            vec![11]
        );
    }

    #[tokio::test]
    async fn delta_gap_falls_back_to_snapshot() {
        let n = parse(&prior("A", 10), &doc("A", 12, &[(12, "cc")]))
            .await
            .unwrap();
        assert_eq!(n.plan, Plan::Snapshot);
    }

    #[tokio::test]
    async fn session_change_plans_snapshot() {
        let n = parse(&prior("A", 10), &doc("B", 1, &[])).await.unwrap();
        assert_eq!(n.plan, Plan::Snapshot);
    }

    #[tokio::test]
    async fn equal_serial_is_up_to_date() {
        let n = parse(&prior("A", 10), &doc("A", 10, &[])).await.unwrap();
        assert_eq!(n.plan, Plan::UpToDate);
    }

    #[tokio::test]
    async fn up_to_date_is_sticky_across_delta_parsing() {
        // Stale deltas still listed upstream must not disturb the decision.
        let n = parse(&prior("A", 10), &doc("A", 10, &[(9, "bb"), (10, "cc")]))
            .await
            .unwrap();
        assert_eq!(n.plan, Plan::UpToDate);
    }

    #[tokio::test]
    async fn backwards_serial_is_invalid() {
        let n = parse(&prior("A", 10), &doc("A", 9, &[])).await.unwrap();
        assert_eq!(n.plan, Plan::Invalid);
    }

    #[tokio::test]
    async fn duplicate_delta_serial_fails() {
        let err = parse(&prior("A", 10), &doc("A", 12, &[(11, "bb"), (11, "cc")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::DuplicateDelta { serial: 11 }));
    }

    #[tokio::test]
    async fn missing_header_attribute_fails() {
        let doc = format!(
            "<notification xmlns=\"{NS}\" version=\"1\" serial=\"3\">\
             <snapshot uri=\"https://host/s.xml\" hash=\"{}\"/></notification>",
            hash_hex("aa"),
        );
        let err = parse(&prior("A", 1), &doc).await.unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingAttribute {
                attribute: "session_id",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_attribute_fails() {
        let doc = format!(
            "<notification xmlns=\"{NS}\" version=\"1\" session_id=\"A\" serial=\"3\" \
             color=\"red\"><snapshot uri=\"u\" hash=\"{}\"/></notification>",
            hash_hex("aa"),
        );
        assert!(parse(&prior("A", 1), &doc).await.is_err());
    }

    #[tokio::test]
    async fn missing_snapshot_fails() {
        let doc = format!(
            "<notification xmlns=\"{NS}\" version=\"1\" session_id=\"A\" serial=\"3\">\
             </notification>"
        );
        let err = parse(&prior("A", 1), &doc).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEnd { .. }));
    }

    #[tokio::test]
    async fn foreign_element_fails() {
        let doc = format!(
            "<notification xmlns=\"{NS}\" version=\"1\" session_id=\"A\" serial=\"3\">\
             <publish uri=\"u\"/></notification>"
        );
        let err = parse(&prior("A", 1), &doc).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedElement { .. }));
    }

    #[tokio::test]
    async fn character_data_must_be_whitespace() {
        let doc = format!(
            "<notification xmlns=\"{NS}\" version=\"1\" session_id=\"A\" serial=\"3\">bad\
             <snapshot uri=\"u\" hash=\"{}\"/></notification>",
            hash_hex("aa"),
        );
        let err = parse(&prior("A", 1), &doc).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedText));
    }

    #[tokio::test]
    async fn truncated_document_fails() {
        let doc = format!(
            "<notification xmlns=\"{NS}\" version=\"1\" session_id=\"A\" serial=\"3\">\
             <snapshot uri=\"u\" hash=\"{}\"/>",
            hash_hex("aa"),
        );
        // Depending on the reader this surfaces as a syntax error at EOF or
        // as an incomplete document from finish(); both must fail.
        assert!(parse(&prior("A", 1), &doc).await.is_err());
    }

    #[tokio::test]
    async fn bad_version_fails() {
        let doc = format!(
            "<notification xmlns=\"{NS}\" version=\"2\" session_id=\"A\" serial=\"3\">\
             <snapshot uri=\"u\" hash=\"{}\"/></notification>",
            hash_hex("aa"),
        );
        assert!(parse(&prior("A", 1), &doc).await.is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn run_plan(prior_serial: u64, serial: u64, delta_serials: Vec<u64>) -> (Plan, Vec<u64>) {
            let deltas: Vec<(u64, String)> = delta_serials
                .iter()
                .map(|s| (*s, format!("{:02x}", (s % 255) as u8)))
                .collect();
            let rendered: Vec<(u64, &str)> = deltas
                .iter()
                .map(|(s, fill)| (*s, fill.as_str()))
                .collect();
            let body = doc("A", serial, &rendered);
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            let n = rt
                .block_on(parse(&prior("A", prior_serial), &body))
                .unwrap();
            (n.plan, n.deltas.iter().map(|d| d.serial).collect())
        }

        proptest! {
            // The plan must not depend on the order deltas were listed in.
            #[test]
            fn plan_is_order_independent(
                prior_serial in 1u64..50,
                count in 0u64..8,
                serials in proptest::collection::vec(1u64..80, 0..8),
            ) {
                let serial = prior_serial + count;
                let mut contiguous: Vec<u64> =
                    (prior_serial + 1..=serial).collect();
                contiguous.extend(serials.iter().copied());
                contiguous.sort_unstable();
                contiguous.dedup();

                let (forward, _) = run_plan(prior_serial, serial, contiguous.clone());
                let mut reversed = contiguous.clone();
                reversed.reverse();
                let (backward, _) = run_plan(prior_serial, serial, reversed);
                prop_assert_eq!(forward, backward);
            }

            // A plan of Deltas covers exactly prior+1..=serial contiguously.
            #[test]
            fn delta_plan_is_contiguous(
                prior_serial in 1u64..50,
                count in 1u64..8,
            ) {
                let serial = prior_serial + count;
                let serials: Vec<u64> = (prior_serial + 1..=serial).collect();
                let (plan, kept) = run_plan(prior_serial, serial, serials.clone());
                prop_assert_eq!(plan, Plan::Deltas);
                prop_assert_eq!(kept, serials);
            }
        }
    }
}
