//! Unix-socket transport bridging the wire format to the typed channel.
//!
//! Two dedicated threads pump the control socket so the engine only ever
//! sees typed messages: the reader decodes frames (collecting `SCM_RIGHTS`
//! descriptors as they arrive) and the writer encodes reports. Descriptors
//! are matched FIFO to decoded body frames; a body frame without a queued
//! descriptor, or a descriptor left over once every buffered frame has
//! been decoded, means the parent broke the transport contract.
//!
//! Closing either direction tears the worker down: a read of zero bytes
//! drops the request sender (the scheduler sees its channel close), and a
//! dropped report sender ends the writer.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use bytes::BytesMut;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::wire::{self, RequestHeader, WireError};
use super::{ControlLink, Report, Request};

/// Receive buffer for one socket read.
const RECV_BUF_SIZE: usize = 8 * 1024;

/// Errors that end a transport pump.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket failed.
    #[error("control socket error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be decoded.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A body frame arrived with no descriptor to attach.
    #[error("body frame arrived without a descriptor")]
    MissingDescriptor,

    /// A descriptor arrived that no body frame claims.
    #[error("descriptor arrived with a non-body frame")]
    StrayDescriptor,
}

/// Spawns the pump threads over `socket` and returns the worker's end of
/// the typed channel.
pub fn spawn(socket: UnixStream) -> io::Result<ControlLink> {
    let reader = socket.try_clone()?;
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (report_tx, report_rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("control-reader".into())
        .spawn(move || match read_loop(&reader, &request_tx) {
            Ok(()) => info!("parent closed the control socket"),
            Err(e) => error!(error = %e, "control socket read failed"),
        })?;

    std::thread::Builder::new()
        .name("control-writer".into())
        .spawn(move || {
            if let Err(e) = write_loop(socket, report_rx) {
                error!(error = %e, "control socket write failed");
            }
        })?;

    Ok(ControlLink {
        requests: request_rx,
        reports: report_tx,
    })
}

fn read_loop(
    socket: &UnixStream,
    requests: &mpsc::UnboundedSender<Request>,
) -> Result<(), TransportError> {
    let mut pending = BytesMut::with_capacity(RECV_BUF_SIZE);
    let mut descriptors: VecDeque<OwnedFd> = VecDeque::new();
    let mut chunk = [0u8; RECV_BUF_SIZE];

    loop {
        let (n, descriptor) = recv_with_fd(socket, &mut chunk)?;
        if let Some(descriptor) = descriptor {
            descriptors.push_back(descriptor);
        }
        if n == 0 {
            return if descriptors.is_empty() {
                Ok(())
            } else {
                Err(TransportError::StrayDescriptor)
            };
        }
        pending.extend_from_slice(&chunk[..n]);

        while let Some(frame) = wire::extract_frame(&mut pending)? {
            let request = match wire::decode_request(frame)? {
                RequestHeader::Start {
                    id,
                    local_path,
                    notify_uri,
                    state,
                } => Request::Start {
                    id,
                    local_path,
                    notify_uri,
                    state,
                },
                RequestHeader::HttpBody { id } => {
                    let descriptor = descriptors
                        .pop_front()
                        .ok_or(TransportError::MissingDescriptor)?;
                    let file = tokio::fs::File::from_std(std::fs::File::from(descriptor));
                    Request::HttpBody {
                        id,
                        body: Box::new(file),
                    }
                }
                RequestHeader::HttpDone {
                    id,
                    status,
                    last_modified,
                } => Request::HttpDone {
                    id,
                    status,
                    last_modified,
                },
                RequestHeader::FileAck { id, ok } => Request::FileAck { id, ok },
            };
            if requests.send(request).is_err() {
                // The worker is gone; nothing left to deliver to.
                return Ok(());
            }
        }

        // With no partially buffered frame every received frame has been
        // decoded, so a still-queued descriptor belongs to no body frame.
        if pending.is_empty() && !descriptors.is_empty() {
            return Err(TransportError::StrayDescriptor);
        }
    }
}

fn write_loop(
    mut socket: UnixStream,
    mut reports: mpsc::UnboundedReceiver<Report>,
) -> Result<(), TransportError> {
    while let Some(report) = reports.blocking_recv() {
        let frame = wire::encode_report(&report)?;
        socket.write_all(&frame)?;
    }
    Ok(())
}

/// Receives bytes plus at most one `SCM_RIGHTS` descriptor.
fn recv_with_fd(socket: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;
    let bytes = msg.bytes;

    let mut received: Vec<OwnedFd> = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                // Safety: SCM_RIGHTS hands over freshly duplicated
                // descriptors that nothing else in this process owns.
                received.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    match received.len() {
        0 => Ok((bytes, None)),
        1 => Ok((bytes, received.pop())),
        n => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received {n} descriptors in one message"),
        )),
    }
}

/// Sends bytes plus an optional descriptor. Parent-side helper.
pub fn send_with_fd(
    socket: &UnixStream,
    bytes: &[u8],
    descriptor: Option<BorrowedFd<'_>>,
) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let raw = descriptor.map(|fd| [fd.as_raw_fd()]);
    let cmsgs: Vec<ControlMessage<'_>> = match &raw {
        Some(fds) => vec![ControlMessage::ScmRights(fds)],
        None => Vec::new(),
    };
    sendmsg::<()>(
        socket.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(io::Error::from)
}
