//! Routing of control messages to per-repository session tasks.
//!
//! The scheduler owns the worker's end of the control channel and a
//! registry of live sessions. Parent requests are routed to session
//! inboxes; sessions report back through the shared outgoing queue and
//! notify the scheduler when they terminate. At most [`MAX_SESSIONS`]
//! sessions hold fetch slots at once; later sessions queue on the
//! semaphore until a slot frees.
//!
//! The worker lives exactly as long as the control channel: when the
//! parent closes it, the scheduler cancels every session and returns
//! without draining. A protocol violation (a message for a session that
//! does not exist, a start for one that does, or a message a session
//! cannot accept in its current phase) aborts the worker, since the two
//! processes no longer agree on the channel state.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::control::{ControlLink, Report, Request};
use crate::session::{Session, SessionMsg, SessionNote, Violation};
use crate::types::SessionId;

/// Concurrent session limit.
pub const MAX_SESSIONS: usize = 12;

/// Worker-fatal protocol errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A message named a session that is not live. File acks are exempt:
    /// they may legitimately race a session's teardown.
    #[error("received {kind} for unknown session {id}")]
    UnknownSession { id: SessionId, kind: &'static str },

    /// A start message reused a live session id.
    #[error("received start for already-live session {id}")]
    DuplicateSession { id: SessionId },

    /// A session received a message it cannot accept in its phase.
    #[error(transparent)]
    Session(#[from] Violation),
}

struct SessionEntry {
    inbox: mpsc::UnboundedSender<SessionMsg>,
}

/// The worker's event loop.
pub struct Scheduler {
    requests: mpsc::UnboundedReceiver<Request>,
    reports: mpsc::UnboundedSender<Report>,
    sessions: HashMap<SessionId, SessionEntry>,
    notes_tx: mpsc::UnboundedSender<SessionNote>,
    notes_rx: mpsc::UnboundedReceiver<SessionNote>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler over the worker's end of the control channel.
    pub fn new(link: ControlLink) -> Self {
        Self::with_shutdown(link, CancellationToken::new())
    }

    /// Creates a scheduler with an externally owned shutdown token.
    pub fn with_shutdown(link: ControlLink, cancel: CancellationToken) -> Self {
        let (notes_tx, notes_rx) = mpsc::unbounded_channel();
        Scheduler {
            requests: link.requests,
            reports: link.reports,
            sessions: HashMap::new(),
            notes_tx,
            notes_rx,
            limit: Arc::new(Semaphore::new(MAX_SESSIONS)),
            cancel,
        }
    }

    /// Runs until the control channel closes or the parent breaks protocol.
    ///
    /// Either way every session is cancelled on the way out; a closed
    /// channel is a clean exit, a violation is an error for the binary to
    /// report.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(max_sessions = MAX_SESSIONS, "worker ready");
        let result = self.serve().await;
        self.cancel.cancel();
        if let Err(e) = &result {
            error!(error = %e, "aborting on protocol violation");
        }
        result
    }

    async fn serve(&mut self) -> Result<(), WorkerError> {
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request)?,
                    None => {
                        info!("control channel closed, exiting");
                        return Ok(());
                    }
                },
                note = self.notes_rx.recv() => {
                    // Never `None`: the scheduler keeps a sender of its own.
                    if let Some(note) = note {
                        self.handle_note(note)?;
                    }
                }
            }
        }
    }

    fn handle_request(&mut self, request: Request) -> Result<(), WorkerError> {
        match request {
            Request::Start {
                id,
                local_path,
                notify_uri,
                state,
            } => {
                if self.sessions.contains_key(&id) {
                    return Err(WorkerError::DuplicateSession { id });
                }
                debug!(session = %id, repository = %local_path, "starting session");

                let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
                let session = Session::new(
                    id,
                    local_path,
                    notify_uri,
                    state,
                    inbox_rx,
                    self.reports.clone(),
                    self.notes_tx.clone(),
                    self.cancel.child_token(),
                );
                tokio::spawn(session.run(self.limit.clone()));
                self.sessions.insert(id, SessionEntry { inbox: inbox_tx });
                Ok(())
            }

            Request::HttpBody { id, body } => {
                self.route(id, "body stream", SessionMsg::Body(body))
            }

            Request::HttpDone {
                id,
                status,
                last_modified,
            } => self.route(
                id,
                "fetch result",
                SessionMsg::Done {
                    status,
                    last_modified,
                },
            ),

            Request::FileAck { id, ok } => {
                // Acks may trail a session that already failed and was
                // reaped; they are accounted when the session is live and
                // dropped otherwise.
                match self.sessions.get(&id) {
                    Some(entry) => {
                        let _ = entry.inbox.send(SessionMsg::FileAck { ok });
                    }
                    None => debug!(session = %id, "dropping file ack for unknown session"),
                }
                Ok(())
            }
        }
    }

    fn route(&self, id: SessionId, kind: &'static str, msg: SessionMsg) -> Result<(), WorkerError> {
        let entry = self
            .sessions
            .get(&id)
            .ok_or(WorkerError::UnknownSession { id, kind })?;
        entry
            .inbox
            .send(msg)
            .map_err(|_| WorkerError::UnknownSession { id, kind })
    }

    fn handle_note(&mut self, note: SessionNote) -> Result<(), WorkerError> {
        match note {
            SessionNote::Finished { id } => {
                debug!(session = %id, "session reaped");
                self.sessions.remove(&id);
                Ok(())
            }
            SessionNote::Violation(violation) => Err(violation.into()),
        }
    }
}
