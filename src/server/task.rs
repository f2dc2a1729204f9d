//! Worker-side stages of a connection.
//!
//! The reactor hands a [`Connection`] to the pool inside a [`ConnectionTask`].
//! The task runs one read or write stage, decides what the socket should wait
//! for next, and sends the connection back through the [`CompletionQueue`].
//! While a task holds the connection the reactor has nothing to hand out, so
//! no two stages for one socket ever overlap.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use mio::{Interest, Token, Waker};
use tracing::{debug, error};

use super::connection::Connection;
use crate::workers::Job;

/// Which readiness the task is answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Read,
    Write,
}

/// What the reactor should do with a connection once a task is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Re-register for the given readiness.
    Rearm(Interest),
    Close,
}

/// A connection coming back from a worker.
#[derive(Debug)]
pub struct Completion {
    pub token: Token,
    pub conn: Box<Connection>,
    pub next: Next,
}

/// Completions flowing from workers to the reactor. Every push wakes the
/// reactor's poll.
#[derive(Debug)]
pub struct CompletionQueue {
    queue: SegQueue<Completion>,
    waker: Arc<Waker>,
}

impl CompletionQueue {
    /// Creates an empty queue that wakes `waker` on every push.
    pub fn new(waker: Arc<Waker>) -> Self {
        Self {
            queue: SegQueue::new(),
            waker,
        }
    }

    /// Queues a completion and wakes the reactor.
    pub fn push(&self, completion: Completion) {
        self.queue.push(completion);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "failed to wake reactor");
        }
    }

    /// Takes the oldest completion, if any.
    pub fn pop(&self) -> Option<Completion> {
        self.queue.pop()
    }
}

/// One read or write stage for one connection.
#[derive(Debug)]
pub struct ConnectionTask {
    token: Token,
    kind: TaskKind,
    conn: Box<Connection>,
    completions: Arc<CompletionQueue>,
}

impl ConnectionTask {
    /// Wraps one stage of work for `conn`.
    pub fn new(
        token: Token,
        kind: TaskKind,
        conn: Box<Connection>,
        completions: Arc<CompletionQueue>,
    ) -> Self {
        Self {
            token,
            kind,
            conn,
            completions,
        }
    }

    /// Gives the connection back without running the task.
    pub fn into_connection(self) -> Box<Connection> {
        self.conn
    }
}

impl Job for ConnectionTask {
    fn run(self) {
        let Self {
            token,
            kind,
            mut conn,
            completions,
        } = self;
        let next = run_stage(kind, &mut conn);
        debug!(token = token.0, ?kind, ?next, "task done");
        completions.push(Completion { token, conn, next });
    }
}

/// Runs one stage against `conn` and returns the follow-up.
pub fn run_stage<S: Read + Write>(kind: TaskKind, conn: &mut Connection<S>) -> Next {
    match kind {
        TaskKind::Read => on_read(conn),
        TaskKind::Write => on_write(conn),
    }
}

fn on_read<S: Read + Write>(conn: &mut Connection<S>) -> Next {
    match conn.read() {
        Ok(0) => Next::Close,
        Err(e) if !is_transient(&e) => {
            debug!(peer = %conn.peer(), error = %e, "read failed");
            Next::Close
        }
        _ => on_process(conn),
    }
}

fn on_process<S: Read + Write>(conn: &mut Connection<S>) -> Next {
    if conn.process() {
        Next::Rearm(Interest::WRITABLE)
    } else {
        Next::Rearm(Interest::READABLE)
    }
}

fn on_write<S: Read + Write>(conn: &mut Connection<S>) -> Next {
    let result = conn.write();
    if conn.to_write_bytes() == 0 {
        return if conn.is_keep_alive() {
            on_process(conn)
        } else {
            Next::Close
        };
    }
    match result {
        Ok(_) => Next::Rearm(Interest::WRITABLE),
        Err(e) if is_transient(&e) => Next::Rearm(Interest::WRITABLE),
        Err(e) => {
            debug!(peer = %conn.peer(), error = %e, "write failed");
            Next::Close
        }
    }
}

/// `WouldBlock` and `Interrupted` mean "try again later", anything else is fatal.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
