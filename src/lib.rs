//! RRDP sync worker - streams RPKI repository snapshots and deltas.
//!
//! This library is the engine of a worker process: a parent performs the
//! HTTPS fetches and writes objects to disk, while the worker drives the
//! per-repository session state machines, parses the streamed RRDP
//! documents, verifies their digests, and reports publish/withdraw file
//! events back over a typed control channel.

pub mod control;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod types;
pub mod xml;
