//! Process-wide server state shared by the reactor and every worker.
//!
//! One [`ServerContext`] is created when the server binds and dropped when it
//! shuts down; connections hold an `Arc` to it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::database::CredentialPool;

/// Settings and counters every connection reads.
#[derive(Debug)]
pub struct ServerContext {
    resource_root: PathBuf,
    conn_edge: bool,
    live: AtomicUsize,
    credentials: Option<CredentialPool>,
}

impl ServerContext {
    /// Creates a context with no live connections. `None` for `credentials`
    /// answers every login and registration with 503.
    pub fn new(
        resource_root: impl Into<PathBuf>,
        conn_edge: bool,
        credentials: Option<CredentialPool>,
    ) -> Self {
        Self {
            resource_root: resource_root.into(),
            conn_edge,
            live: AtomicUsize::new(0),
            credentials,
        }
    }

    /// Directory request paths are resolved against.
    pub fn resource_root(&self) -> &Path {
        &self.resource_root
    }

    /// Whether connection I/O drains until `WouldBlock`.
    pub fn conn_edge(&self) -> bool {
        self.conn_edge
    }

    /// The pool form checks borrow backends from.
    pub fn credentials(&self) -> Option<&CredentialPool> {
        self.credentials.as_ref()
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Counts a new connection; returns the new total.
    pub(crate) fn connection_opened(&self) -> usize {
        self.live.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Counts a closed connection; returns the new total.
    pub(crate) fn connection_closed(&self) -> usize {
        self.live.fetch_sub(1, Ordering::AcqRel) - 1
    }
}
