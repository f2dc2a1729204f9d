//! Readiness-driven HTTP server.
//!
//! One reactor thread owns the [`mio::Poll`], the listener, the connection
//! table and the idle-timeout heap. Socket reads, request parsing, response
//! building and socket writes happen on the worker pool.
//!
//! A connection slot is either `Idle` (armed in the poll, owned by the table)
//! or `Busy` (its [`Connection`] has been moved into a worker task). Events
//! for a busy slot are ignored; the task returns the connection through the
//! completion queue and the reactor re-registers it. This gives every socket
//! one-shot semantics: at most one stage runs for it at a time. Idle timers
//! only close `Idle` slots; one that fires on a busy slot is pushed back.

pub mod connection;
pub mod task;

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, TriggerMode};
use crate::context::ServerContext;
use crate::database::{CredentialPool, MemoryUserTable};
use crate::timer::TimerHeap;
use crate::workers::WorkerPool;

pub use connection::Connection;
pub use task::{Completion, CompletionQueue, ConnectionTask, Next, TaskKind};

/// Errors produced while setting the server up or running its loop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("port {0} is out of range (use 0 or 1024..=65535)")]
    InvalidPort(u16),

    #[error("invalid configuration: {0}")]
    Config(String),
}

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const LISTEN_BACKLOG: i32 = 6;
const MAX_EVENTS: usize = 1024;
const LINGER: Duration = Duration::from_secs(1);
const BUSY_REPLY: &[u8] = b"Server busy!";

/// Deferred work scheduled on the timer heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    CloseConnection(Token),
}

enum Slot {
    Idle(Box<Connection>),
    Busy,
}

/// Stops a running [`Server`] from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Asks the reactor to stop and wakes it.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "failed to wake reactor for shutdown");
        }
    }
}

/// The rttpd server.
///
/// # Examples
///
/// ```rust,no_run
/// use rttpd::config::ServerConfig;
/// use rttpd::server::Server;
///
/// fn main() -> Result<(), rttpd::ServerError> {
///     let mut server = Server::bind(ServerConfig::default())?;
///     server.run()
/// }
/// ```
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    trigger: TriggerMode,
    idle_timeout: Option<Duration>,
    max_connections: usize,
    ctx: Arc<ServerContext>,
    timers: TimerHeap<Token, TimerAction>,
    connections: HashMap<Token, Slot>,
    next_token: usize,
    pool: WorkerPool<ConnectionTask>,
    completions: Arc<CompletionQueue>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Server {
    /// Binds the listener and starts the worker pool, with an empty
    /// in-memory user table behind the credential pool.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the port cannot be bound, and
    /// [`ServerError::InvalidPort`] / [`ServerError::Config`] for a
    /// configuration that fails validation.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let credentials = (config.credential_pool_size > 0).then(|| {
            CredentialPool::in_memory(
                &MemoryUserTable::new(),
                config.credential_pool_size,
                config.credential_timeout(),
            )
        });
        Self::bind_with_credentials(config, credentials)
    }

    /// Like [`bind`](Self::bind), with a caller-supplied credential pool.
    /// `None` answers every login and registration with 503.
    pub fn bind_with_credentials(
        config: ServerConfig,
        credentials: Option<CredentialPool>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let trigger = config.trigger();

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let std_listener = listen(addr, config.linger).map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let resource_root = std::env::current_dir()?.join(&config.resource_dir);
        let credential_slots = credentials.as_ref().map_or(0, CredentialPool::size);
        let ctx = Arc::new(ServerContext::new(
            resource_root,
            trigger.conn_edge,
            credentials,
        ));
        let pool = WorkerPool::new(config.worker_threads, config.task_queue_capacity())?;

        info!(
            port = local_addr.port(),
            linger = config.linger,
            listen_edge = trigger.listen_edge,
            conn_edge = trigger.conn_edge,
            resources = %ctx.resource_root().display(),
            workers = config.worker_threads,
            task_queue = config.task_queue_capacity(),
            credential_pool = credential_slots,
            idle_timeout_ms = config.timeout_ms,
            "server init"
        );

        Ok(Self {
            poll,
            listener,
            local_addr,
            trigger,
            idle_timeout: config.idle_timeout(),
            max_connections: config.max_connections,
            ctx,
            timers: TimerHeap::new(),
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
            pool,
            completions: Arc::new(CompletionQueue::new(Arc::clone(&waker))),
            stop: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a handle that stops [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Connections currently open.
    pub fn live_connections(&self) -> usize {
        self.ctx.live_connections()
    }

    /// Runs the event loop until [`ShutdownHandle::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if waiting on the poll itself fails.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "rttpd listening");
        let mut events = Events::with_capacity(MAX_EVENTS);

        while !self.stop.load(Ordering::Acquire) {
            let timeout = self.expire_idle();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                self.teardown();
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_clients(),
                    WAKER => self.drain_completions(),
                    token => self.dispatch(token, event),
                }
            }
        }

        self.teardown();
        info!("server stopped");
        Ok(())
    }

    /// Fires expired idle timers and returns how long the poll may block.
    fn expire_idle(&mut self) -> Option<Duration> {
        self.idle_timeout?;
        let mut expired = Vec::new();
        let wait = self
            .timers
            .next_tick(|_, action| expired.push(action));
        for action in expired {
            match action {
                TimerAction::CloseConnection(token) => self.expire(token),
            }
        }
        // A timer pushed back by `expire` belongs to a busy slot, whose
        // completion wakes the poll anyway.
        wait
    }

    /// Closes an idle connection whose timer fired. A connection a worker is
    /// still busy with gets a fresh timeout instead.
    fn expire(&mut self, token: Token) {
        match self.connections.get(&token) {
            Some(Slot::Idle(_)) => {
                debug!(token = token.0, "idle timeout");
                self.close_connection(token);
            }
            Some(Slot::Busy) => {
                debug!(token = token.0, "idle timeout on busy connection, postponed");
                if let Some(timeout) = self.idle_timeout {
                    self.timers
                        .add(token, timeout, TimerAction::CloseConnection(token));
                }
            }
            None => {}
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            };

            if self.ctx.live_connections() >= self.max_connections {
                reject_busy(stream, peer);
                // Whatever is still queued is picked up once the listener
                // is re-armed below.
                self.rearm_listener();
                return;
            }
            self.add_client(stream, peer);

            if !self.trigger.listen_edge {
                break;
            }
        }
        if !self.trigger.listen_edge {
            self.rearm_listener();
        }
    }

    fn rearm_listener(&mut self) {
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut self.listener, LISTENER, Interest::READABLE)
        {
            error!(error = %e, "failed to re-arm listener");
        }
    }

    fn add_client(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            error!(%peer, error = %e, "failed to register client");
            return;
        }
        if let Some(timeout) = self.idle_timeout {
            self.timers
                .add(token, timeout, TimerAction::CloseConnection(token));
        }
        let conn = Connection::new(stream, peer, Arc::clone(&self.ctx));
        self.connections.insert(token, Slot::Idle(Box::new(conn)));
    }

    /// Hands an armed connection to the worker pool.
    fn dispatch(&mut self, token: Token, event: &Event) {
        let Some(slot) = self.connections.get_mut(&token) else {
            return;
        };
        if matches!(slot, Slot::Busy) {
            return;
        }

        if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            self.close_connection(token);
            return;
        }
        let kind = if event.is_readable() {
            TaskKind::Read
        } else if event.is_writable() {
            TaskKind::Write
        } else {
            return;
        };

        let Slot::Idle(conn) = std::mem::replace(slot, Slot::Busy) else {
            return;
        };
        if let Some(timeout) = self.idle_timeout {
            self.timers.adjust(token, timeout);
        }

        let task = ConnectionTask::new(token, kind, conn, Arc::clone(&self.completions));
        if let Err(rejected) = self.pool.add_task(task) {
            warn!(token = token.0, error = %rejected, "worker queue refused task");
            self.connections.remove(&token);
            self.timers.cancel(token);
            self.release(rejected.into_inner().into_connection());
        }
    }

    /// Takes connections back from finished tasks and re-arms or closes them.
    fn drain_completions(&mut self) {
        while let Some(Completion { token, conn, next }) = self.completions.pop() {
            match next {
                Next::Rearm(interest) => self.rearm(token, conn, interest),
                Next::Close => {
                    self.connections.remove(&token);
                    self.timers.cancel(token);
                    self.release(conn);
                }
            }
        }
    }

    fn rearm(&mut self, token: Token, mut conn: Box<Connection>, interest: Interest) {
        let armed = match conn.stream_mut() {
            Some(stream) => self.poll.registry().reregister(stream, token, interest),
            None => Err(io::ErrorKind::NotConnected.into()),
        };
        match armed {
            Ok(()) => {
                if let Some(timeout) = self.idle_timeout {
                    self.timers.adjust(token, timeout);
                }
                self.connections.insert(token, Slot::Idle(conn));
            }
            Err(e) => {
                warn!(token = token.0, error = %e, "failed to re-arm client");
                self.connections.remove(&token);
                self.timers.cancel(token);
                self.release(conn);
            }
        }
    }

    /// Closes `token` if it is idle. A busy slot is left to its task.
    fn close_connection(&mut self, token: Token) {
        if !matches!(self.connections.get(&token), Some(Slot::Idle(_))) {
            return;
        }
        self.timers.cancel(token);
        if let Some(Slot::Idle(conn)) = self.connections.remove(&token) {
            self.release(conn);
        }
    }

    fn release(&self, mut conn: Box<Connection>) {
        if let Some(stream) = conn.stream_mut() {
            if let Err(e) = self.poll.registry().deregister(stream) {
                debug!(peer = %conn.peer(), error = %e, "deregister failed");
            }
        }
        conn.close();
    }

    fn teardown(&mut self) {
        self.pool.shutdown();
        while let Some(completion) = self.completions.pop() {
            self.release(completion.conn);
        }
        let slots: Vec<Slot> = self.connections.drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Slot::Idle(conn) = slot {
                self.release(conn);
            }
        }
        self.timers.clear();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("trigger", &self.trigger)
            .field("connections", &self.connections.len())
            .field("live", &self.ctx.live_connections())
            .finish()
    }
}

/// Creates the listening socket: address reuse, optional one-second linger,
/// a short backlog, non-blocking.
fn listen(addr: SocketAddr, linger: bool) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_linger(linger.then_some(LINGER))?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn reject_busy(mut stream: TcpStream, peer: SocketAddr) {
    warn!(%peer, "connection limit reached, rejecting client");
    if let Err(e) = stream.write_all(BUSY_REPLY) {
        debug!(%peer, error = %e, "busy reply not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;

    fn config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            port: 0,
            worker_threads: 2,
            resource_dir: dir.to_path_buf(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn bind_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            port: 22,
            ..config(dir.path())
        };
        assert!(matches!(Server::bind(cfg), Err(ServerError::InvalidPort(22))));
    }

    #[test]
    fn binding_a_taken_port_fails() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let cfg = ServerConfig {
            port: taken.local_addr().unwrap().port(),
            ..config(dir.path())
        };
        // Address reuse does not allow a second listener on an active one.
        assert!(matches!(Server::bind(cfg), Err(ServerError::Bind { .. })));
    }

    #[test]
    fn over_capacity_clients_get_busy_reply() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            max_connections: 1,
            ..config(dir.path())
        };
        let mut server = Server::bind(cfg).unwrap();
        let port = server.local_addr().port();
        let shutdown = server.shutdown_handle();
        let reactor = thread::spawn(move || server.run());

        let _first = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        thread::sleep(Duration::from_millis(100));
        let mut second = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reply = Vec::new();
        second.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, BUSY_REPLY);

        shutdown.shutdown();
        reactor.join().unwrap().unwrap();
    }
}
