//! Per-repository session: one in-flight sync driven to completion.
//!
//! A session runs as its own task and owns everything for its sync: the
//! prior repository state, the inbox the scheduler routes parent messages
//! into, the handler and digest context of whichever document is currently
//! streaming, and the pending/failed file counters.
//!
//! The progression is NOTIFICATION, then either nothing (already up to
//! date), the snapshot, or the advertised delta chain. Each fetch follows
//! the same cycle: emit the request, consume the attached body through the
//! digesting reader and streaming parser, wait for the fetch result and
//! for every emitted file event to be acknowledged, then evaluate the
//! outcome. Any failed delta step falls back to one snapshot attempt, per
//! RFC 8182; any other failure ends the session with `ok = 0` and leaves
//! recovery to the parent.

use std::io;
use std::sync::Arc;

use quick_xml::Reader;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::control::{BodyStream, Report};
use crate::types::{Digest, RepositoryState, SessionId};
use crate::xml::delta::DeltaHandler;
use crate::xml::notification::{Notification, NotificationHandler, Plan};
use crate::xml::publish::FileSink;
use crate::xml::snapshot::SnapshotHandler;
use crate::xml::{self, DocExpect, ElementHandler, ParseError};

mod body;

use body::DigestingReader;

/// Read buffer for body streams.
const READ_BUF_SIZE: usize = 32 * 1024;

/// Per-session messages the scheduler routes from the parent.
pub(crate) enum SessionMsg {
    /// Body stream for the pending fetch.
    Body(BodyStream),
    /// The pending fetch concluded.
    Done {
        status: u16,
        last_modified: Option<String>,
    },
    /// One file event was applied (or rejected) by the parent.
    FileAck { ok: bool },
}

/// Notes a session sends back to the scheduler.
pub(crate) enum SessionNote {
    /// The session terminated and can be reaped.
    Finished { id: SessionId },
    /// The parent broke the per-session protocol; the worker must abort.
    Violation(Violation),
}

/// A parent message that is invalid for the session's current phase.
///
/// These are worker-fatal: the control channel state is no longer
/// trustworthy once parent and worker disagree on a session's phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session {id}: received {got} while expecting {expected}")]
pub struct Violation {
    pub id: SessionId,
    pub got: &'static str,
    pub expected: &'static str,
}

/// Why one fetch did not produce a usable document.
///
/// All of these are session-local; they end the session (or trigger the
/// delta fallback) but never the worker.
#[derive(Debug, Error)]
pub enum FetchFailure {
    /// The document violated its schema or the XML was malformed.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The body digested to something other than the advertised hash.
    #[error("bad message digest: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// The fetch concluded with an unusable HTTP status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// The body stream failed mid-read.
    #[error("read failure on body stream: {0}")]
    Read(#[from] io::Error),

    /// The parent rejected one or more emitted file events.
    #[error("{failed} file event(s) rejected by the parent")]
    FilesRejected { failed: u64 },
}

/// Internal error plumbing for one fetch cycle.
enum FetchError {
    /// Session-local failure; the session decides fallback or end.
    Failure(FetchFailure),
    /// The worker is shutting down; exit without reporting.
    Shutdown,
    /// The parent broke protocol; the worker must abort.
    Violation(Violation),
}

impl From<FetchFailure> for FetchError {
    fn from(failure: FetchFailure) -> Self {
        FetchError::Failure(failure)
    }
}

/// How the session task ended.
enum SessionExit {
    /// Session-local failure: report `End { ok: false }`.
    Failed,
    /// Worker shutdown: exit silently.
    Shutdown,
    /// Protocol violation: escalate to the scheduler.
    Violation(Violation),
}

/// What one consumed body yielded, before the fetch result is known.
///
/// Nothing here is acted on until the parent reports the fetch result;
/// a body that failed to parse or digest is still drained to EOF first.
struct BodyOutcome {
    read_error: Option<io::Error>,
    parse: Result<(), ParseError>,
    digest: Result<(), FetchFailure>,
}

/// The result of the notification fetch.
enum NotificationOutcome {
    /// HTTP 304: the cache is current, nothing to persist.
    NotModified,
    /// A parsed notification plus the fetch's last-modified value.
    Document(Notification, Option<String>),
}

/// One in-flight repository sync.
pub(crate) struct Session {
    id: SessionId,
    local_path: String,
    notify_uri: String,
    repository: RepositoryState,
    inbox: mpsc::UnboundedReceiver<SessionMsg>,
    reports: mpsc::UnboundedSender<Report>,
    notes: mpsc::UnboundedSender<SessionNote>,
    cancel: CancellationToken,
    file_pending: u64,
    file_failed: u64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        local_path: String,
        notify_uri: String,
        repository: RepositoryState,
        inbox: mpsc::UnboundedReceiver<SessionMsg>,
        reports: mpsc::UnboundedSender<Report>,
        notes: mpsc::UnboundedSender<SessionNote>,
        cancel: CancellationToken,
    ) -> Self {
        Session {
            id,
            local_path,
            notify_uri,
            repository,
            inbox,
            reports,
            notes,
            cancel,
            file_pending: 0,
            file_failed: 0,
        }
    }

    /// Drives the session to completion.
    ///
    /// Waits for a concurrency permit before issuing the first fetch; the
    /// permit is held for the session's whole lifetime.
    #[instrument(skip_all, fields(session = %self.id, repository = %self.local_path))]
    pub(crate) async fn run(mut self, limit: Arc<Semaphore>) {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return,
            permit = limit.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        info!(notify = %self.notify_uri, "session started");
        match self.sync().await {
            Ok(()) => self.finish(true),
            Err(SessionExit::Failed) => self.finish(false),
            Err(SessionExit::Shutdown) => {}
            Err(SessionExit::Violation(violation)) => {
                let _ = self.notes.send(SessionNote::Violation(violation));
            }
        }
    }

    /// The full sync: notification, then whatever the plan dictates.
    async fn sync(&mut self) -> Result<(), SessionExit> {
        let (notification, last_modified) = match self.fetch_notification().await {
            Ok(NotificationOutcome::NotModified) => {
                info!("notification not modified, cache is current");
                return Ok(());
            }
            Ok(NotificationOutcome::Document(notification, last_modified)) => {
                (notification, last_modified)
            }
            Err(e) => return Err(self.fetch_failed("notification", e)),
        };

        let current = RepositoryState {
            session_id: notification.session_id.clone(),
            serial: notification.serial,
            last_modified,
        };

        match notification.plan {
            Plan::UpToDate => {
                debug!(serial = current.serial, "repository already up to date");
                self.send_state(&current)
            }
            Plan::Invalid => {
                warn!("notification cannot be reconciled with stored state");
                Err(SessionExit::Failed)
            }
            Plan::Snapshot => match self.fetch_snapshot(&notification).await {
                Ok(()) => self.send_state(&current),
                Err(e) => Err(self.fetch_failed("snapshot", e)),
            },
            Plan::Deltas => match self.apply_deltas(&notification).await {
                Ok(()) => self.send_state(&current),
                Err(FetchError::Failure(failure)) => {
                    // RFC 8182: a broken delta step gets one snapshot
                    // attempt before the session gives up.
                    warn!(error = %failure, "delta failed, falling back to snapshot");
                    match self.fetch_snapshot(&notification).await {
                        Ok(()) => self.send_state(&current),
                        Err(e) => Err(self.fetch_failed("snapshot", e)),
                    }
                }
                Err(other) => Err(self.fetch_failed("delta", other)),
            },
        }
    }

    /// Fetches and parses the notification document.
    async fn fetch_notification(&mut self) -> Result<NotificationOutcome, FetchError> {
        debug!(uri = %self.notify_uri, "requesting notification");
        self.send_report(Report::HttpRequest {
            id: self.id,
            uri: self.notify_uri.clone(),
            if_modified_since: self.repository.last_modified.clone(),
        })?;

        let mut handler = NotificationHandler::new(&self.repository);
        let body = self.run_body(None, &mut handler).await?;
        let (status, last_modified) = self.wait_done().await?;

        if status == 304 {
            return Ok(NotificationOutcome::NotModified);
        }
        if status != 200 {
            return Err(FetchFailure::Status(status).into());
        }
        if let Some(e) = body.read_error {
            return Err(FetchFailure::Read(e).into());
        }
        body.parse.map_err(FetchFailure::Parse)?;
        let notification = handler.finish().map_err(FetchFailure::Parse)?;
        Ok(NotificationOutcome::Document(notification, last_modified))
    }

    /// Fetches the snapshot and replays it as file events.
    async fn fetch_snapshot(&mut self, notification: &Notification) -> Result<(), FetchError> {
        debug!(
            uri = %notification.snapshot_uri,
            serial = notification.serial,
            "fetching snapshot"
        );
        self.send_report(Report::HttpRequest {
            id: self.id,
            uri: notification.snapshot_uri.clone(),
            if_modified_since: None,
        })?;

        let mut handler = SnapshotHandler::new(
            DocExpect {
                version: notification.version,
                session_id: notification.session_id.clone(),
                serial: notification.serial,
            },
            FileSink::new(self.id, self.reports.clone()),
        );
        let body = self
            .run_body(Some(notification.snapshot_hash), &mut handler)
            .await?;
        self.file_pending += handler.emitted();
        let (status, _) = self.wait_done().await?;
        self.complete(body, status, handler.finish())
    }

    /// Fetches and applies the delta chain in serial order.
    async fn apply_deltas(&mut self, notification: &Notification) -> Result<(), FetchError> {
        for delta in &notification.deltas {
            debug!(serial = delta.serial, uri = %delta.uri, "fetching delta");
            self.send_report(Report::HttpRequest {
                id: self.id,
                uri: delta.uri.clone(),
                if_modified_since: None,
            })?;

            let mut handler = DeltaHandler::new(
                DocExpect {
                    version: notification.version,
                    session_id: notification.session_id.clone(),
                    serial: delta.serial,
                },
                FileSink::new(self.id, self.reports.clone()),
            );
            let body = self.run_body(Some(delta.hash), &mut handler).await?;
            self.file_pending += handler.emitted();
            let (status, _) = self.wait_done().await?;
            self.complete(body, status, handler.finish())?;
        }
        Ok(())
    }

    /// Consumes one body stream: parse, digest, drain.
    ///
    /// A parse failure does not abort the fetch; the remaining body is
    /// drained so the digest covers every byte and the parent is never
    /// left blocked writing the tail. Everything observed is returned for
    /// evaluation once the fetch result arrives.
    async fn run_body<H: ElementHandler>(
        &mut self,
        expected: Option<Digest>,
        handler: &mut H,
    ) -> Result<BodyOutcome, FetchError> {
        let body = self.wait_body().await?;
        let tee = DigestingReader::new(body, expected.is_some());
        let mut reader = Reader::from_reader(BufReader::with_capacity(READ_BUF_SIZE, tee));

        let parse = xml::drive(&mut reader, handler).await;

        let mut buffered = reader.into_inner();
        let mut read_error = None;
        if parse.is_err() {
            if let Err(e) = tokio::io::copy(&mut buffered, &mut tokio::io::sink()).await {
                read_error = Some(e);
            }
        }

        let digest = match (expected, buffered.into_inner().finalize()) {
            (Some(expected), Some(actual)) if expected == actual => Ok(()),
            (Some(expected), Some(actual)) => {
                Err(FetchFailure::DigestMismatch { expected, actual })
            }
            _ => Ok(()),
        };

        Ok(BodyOutcome {
            read_error,
            parse,
            digest,
        })
    }

    /// Waits for the fetch result and for all emitted files to be
    /// acknowledged.
    ///
    /// The result and the acknowledgements may arrive in any order; the
    /// fetch is only considered concluded once both the result is in and
    /// the pending counter is back to zero.
    async fn wait_done(&mut self) -> Result<(u16, Option<String>), FetchError> {
        let mut concluded = None;
        loop {
            if self.file_pending == 0 {
                if let Some(result) = concluded.take() {
                    return Ok(result);
                }
            }
            match self.next_msg().await? {
                SessionMsg::Done {
                    status,
                    last_modified,
                } => {
                    if concluded.is_some() {
                        return Err(self.violation("a second fetch result", "file acks"));
                    }
                    concluded = Some((status, last_modified));
                }
                SessionMsg::FileAck { ok } => self.handle_ack(ok)?,
                SessionMsg::Body(_) => {
                    return Err(self.violation("a body stream", "the fetch result"));
                }
            }
        }
    }

    /// Waits for the body stream of the fetch just requested.
    async fn wait_body(&mut self) -> Result<BodyStream, FetchError> {
        match self.next_msg().await? {
            SessionMsg::Body(body) => Ok(body),
            SessionMsg::Done { .. } => Err(self.violation("the fetch result", "a body stream")),
            SessionMsg::FileAck { .. } => Err(self.violation("a file ack", "a body stream")),
        }
    }

    /// Evaluates a concluded fetch in the order the protocol fixes:
    /// status, stream health, digest, document validity, file results.
    fn complete(
        &self,
        body: BodyOutcome,
        status: u16,
        finished: Result<(), ParseError>,
    ) -> Result<(), FetchError> {
        if status != 200 {
            return Err(FetchFailure::Status(status).into());
        }
        if let Some(e) = body.read_error {
            return Err(FetchFailure::Read(e).into());
        }
        body.digest?;
        body.parse.map_err(FetchFailure::Parse)?;
        finished.map_err(FetchFailure::Parse)?;
        if self.file_failed > 0 {
            return Err(FetchFailure::FilesRejected {
                failed: self.file_failed,
            }
            .into());
        }
        Ok(())
    }

    /// Accounts one file acknowledgement.
    fn handle_ack(&mut self, ok: bool) -> Result<(), FetchError> {
        if self.file_pending == 0 {
            return Err(self.violation("a file ack", "no outstanding file events"));
        }
        self.file_pending -= 1;
        if !ok {
            self.file_failed += 1;
        }
        Ok(())
    }

    /// Receives the next inbox message, or observes shutdown.
    async fn next_msg(&mut self) -> Result<SessionMsg, FetchError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::Shutdown),
            msg = self.inbox.recv() => msg.ok_or(FetchError::Shutdown),
        }
    }

    fn send_report(&self, report: Report) -> Result<(), FetchError> {
        self.reports.send(report).map_err(|_| FetchError::Shutdown)
    }

    fn send_state(&self, state: &RepositoryState) -> Result<(), SessionExit> {
        debug!(
            session_id = %state.session_id,
            serial = state.serial,
            "repository state updated"
        );
        self.reports
            .send(Report::State {
                id: self.id,
                state: state.clone(),
            })
            .map_err(|_| SessionExit::Shutdown)
    }

    fn fetch_failed(&self, stage: &'static str, error: FetchError) -> SessionExit {
        match error {
            FetchError::Failure(failure) => {
                warn!(stage, error = %failure, "fetch failed");
                SessionExit::Failed
            }
            FetchError::Shutdown => SessionExit::Shutdown,
            FetchError::Violation(violation) => SessionExit::Violation(violation),
        }
    }

    fn violation(&self, got: &'static str, expected: &'static str) -> FetchError {
        FetchError::Violation(Violation {
            id: self.id,
            got,
            expected,
        })
    }

    fn finish(&self, ok: bool) {
        if ok {
            info!("session finished, cache up to date");
        } else {
            warn!("session failed");
        }
        let _ = self.reports.send(Report::End { id: self.id, ok });
        let _ = self.notes.send(SessionNote::Finished { id: self.id });
    }
}
