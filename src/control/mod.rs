//! The typed control channel between the worker and its parent process.
//!
//! The engine never touches the wire: the parent's side of the channel is
//! either the in-process test harness or the Unix-socket transport in
//! [`transport`], which decodes frames (see [`wire`]) into [`Request`]
//! values and encodes [`Report`] values back out.
//!
//! Fetched bodies arrive as owned async byte streams attached to
//! [`Request::HttpBody`]; over the real transport they are file descriptors
//! passed as socket ancillary data.

use std::fmt;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::types::{Digest, FileAction, RepositoryState, SessionId};

pub mod wire;

#[cfg(unix)]
pub mod transport;

/// An owned, readable byte stream carrying one fetched HTTP body.
pub type BodyStream = Box<dyn AsyncRead + Send + Unpin>;

/// Messages from the parent to the worker.
pub enum Request {
    /// Create a new session for one repository.
    Start {
        id: SessionId,
        /// Local cache path, used only to identify the repository in logs.
        local_path: String,
        /// URI of the RRDP notification file.
        notify_uri: String,
        /// Previously persisted state, [`RepositoryState::default`] if none.
        state: RepositoryState,
    },

    /// Attach the body stream for the session's pending fetch.
    ///
    /// Valid only while the session is waiting on a fetch it requested, and
    /// always precedes the matching [`Request::HttpDone`].
    HttpBody { id: SessionId, body: BodyStream },

    /// The fetch concluded. May arrive before or after the body stream
    /// reaches EOF, but never before [`Request::HttpBody`].
    HttpDone {
        id: SessionId,
        status: u16,
        last_modified: Option<String>,
    },

    /// Acknowledges one previously emitted [`Report::File`].
    ///
    /// `ok` is false if the parent rejected the file (digest mismatch on
    /// disk, write failure); one rejection fails the whole session.
    FileAck { id: SessionId, ok: bool },
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Start {
                id,
                local_path,
                notify_uri,
                state,
            } => f
                .debug_struct("Start")
                .field("id", id)
                .field("local_path", local_path)
                .field("notify_uri", notify_uri)
                .field("state", state)
                .finish(),
            Request::HttpBody { id, .. } => f
                .debug_struct("HttpBody")
                .field("id", id)
                .finish_non_exhaustive(),
            Request::HttpDone {
                id,
                status,
                last_modified,
            } => f
                .debug_struct("HttpDone")
                .field("id", id)
                .field("status", status)
                .field("last_modified", last_modified)
                .finish(),
            Request::FileAck { id, ok } => f
                .debug_struct("FileAck")
                .field("id", id)
                .field("ok", ok)
                .finish(),
        }
    }
}

/// Messages from the worker to the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Ask the parent to fetch a URI over HTTPS.
    HttpRequest {
        id: SessionId,
        uri: String,
        if_modified_since: Option<String>,
    },

    /// One decoded publish or withdraw record for the parent to apply.
    ///
    /// `hash` is the expected digest of the object currently on disk and is
    /// absent exactly when `action` is [`FileAction::Add`]; `data` is the
    /// decoded object content and is absent exactly when `action` is
    /// [`FileAction::Withdraw`].
    File {
        id: SessionId,
        action: FileAction,
        uri: String,
        hash: Option<Digest>,
        data: Option<Vec<u8>>,
    },

    /// Persist this as the repository's new state.
    State {
        id: SessionId,
        state: RepositoryState,
    },

    /// The session terminated; `ok` is true iff the cache is now up to date.
    End { id: SessionId, ok: bool },
}

impl Report {
    /// Returns the session this report belongs to.
    pub fn session(&self) -> SessionId {
        match self {
            Report::HttpRequest { id, .. }
            | Report::File { id, .. }
            | Report::State { id, .. }
            | Report::End { id, .. } => *id,
        }
    }
}

/// The worker's end of the control channel.
///
/// The outgoing side is a plain FIFO shared by every session; the queue is
/// unbounded because growth is bounded by the number of in-flight file
/// events the parent has not yet applied.
pub struct ControlLink {
    /// Incoming parent requests.
    pub requests: mpsc::UnboundedReceiver<Request>,
    /// Outgoing worker reports.
    pub reports: mpsc::UnboundedSender<Report>,
}

/// The parent's end of the control channel, used by the transport and by
/// tests.
pub struct ControlPeer {
    /// Requests into the worker.
    pub requests: mpsc::UnboundedSender<Request>,
    /// Reports out of the worker.
    pub reports: mpsc::UnboundedReceiver<Report>,
}

/// Creates a connected (worker, parent) channel pair.
pub fn link() -> (ControlLink, ControlPeer) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    (
        ControlLink {
            requests: request_rx,
            reports: report_tx,
        },
        ControlPeer {
            requests: request_tx,
            reports: report_rx,
        },
    )
}
