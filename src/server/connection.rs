//! Per-socket connection state.
//!
//! A [`Connection`] owns the socket, both buffers and the request/response
//! pair. It is only ever touched by one thread at a time: the reactor while
//! it is armed, or the single worker task it has been handed to.

use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::buffer::ByteBuffer;
use crate::context::ServerContext;
use crate::http::{HttpRequest, HttpResponse, StatusCode};

/// A non-edge write keeps going while more than this much is left.
const LARGE_WRITE: usize = 10 * 1024;

/// Unparsed input beyond this is answered with 400 and the connection closed.
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

pub struct Connection<S = TcpStream> {
    stream: Option<S>,
    peer: SocketAddr,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    request: HttpRequest,
    response: HttpResponse,
    /// Bytes of the mapped body already sent.
    file_sent: usize,
    ctx: Arc<ServerContext>,
}

impl<S: Read + Write> Connection<S> {
    /// Wraps an accepted socket and counts it as live.
    pub fn new(stream: S, peer: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        let live = ctx.connection_opened();
        info!(%peer, live, "client connected");
        Self {
            stream: Some(stream),
            peer,
            read_buf: ByteBuffer::default(),
            write_buf: ByteBuffer::default(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            file_sent: 0,
            ctx,
        }
    }

    /// Drains the socket into the read buffer.
    ///
    /// Edge-triggered connections read until the socket reports `WouldBlock`,
    /// end of stream, or more than [`MAX_REQUEST_SIZE`] bytes are buffered;
    /// level-triggered ones read once. The result of the last read is
    /// returned, so `Ok(0)` means the peer closed.
    pub fn read(&mut self) -> io::Result<usize> {
        let edge = self.ctx.conn_edge();
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        loop {
            match self.read_buf.read_from(stream) {
                Ok(n) if n > 0 && edge && self.read_buf.readable_bytes() <= MAX_REQUEST_SIZE => {
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    /// Sends pending header and body bytes with vectored writes.
    ///
    /// Returns the bytes written by this call, or the error that stopped it.
    /// On `WouldBlock` the unsent remainder stays queued for the next call.
    pub fn write(&mut self) -> io::Result<usize> {
        let edge = self.ctx.conn_edge();
        let mut written = 0;
        loop {
            if self.to_write_bytes() == 0 {
                return Ok(written);
            }
            let stream = self.stream.as_mut().ok_or_else(not_connected)?;
            let file = self
                .response
                .file()
                .map_or(&[][..], |body| &body[self.file_sent..]);
            let slices = [IoSlice::new(self.write_buf.peek()), IoSlice::new(file)];
            let n = match stream.write_vectored(&slices) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.advance(n);
            written += n;

            if !edge && self.to_write_bytes() <= LARGE_WRITE {
                return Ok(written);
            }
        }
    }

    fn advance(&mut self, n: usize) {
        let head = self.write_buf.readable_bytes();
        if n >= head {
            self.write_buf.retrieve_all();
            self.file_sent += n - head;
        } else {
            self.write_buf.retrieve(n);
        }
    }

    /// Parses whatever request is buffered and queues its response.
    ///
    /// Returns `false` when nothing was buffered. A malformed or oversized
    /// request is answered with 400 and the connection is not kept alive.
    pub fn process(&mut self) -> bool {
        self.request.reset();
        let pending = self.read_buf.readable_bytes();
        if pending == 0 {
            return false;
        }

        if pending > MAX_REQUEST_SIZE {
            warn!(peer = %self.peer, pending, "request too large");
            self.reject();
        } else {
            self.parse_request();
        }

        self.response.make_response(&mut self.write_buf);
        self.file_sent = 0;
        debug!(
            peer = %self.peer,
            path = self.response.path(),
            head = self.write_buf.readable_bytes(),
            body = self.response.file_len(),
            "response ready"
        );
        true
    }

    fn parse_request(&mut self) {
        match self.request.parse(&mut self.read_buf, self.ctx.credentials()) {
            Ok(()) => {
                let code = self
                    .request
                    .status_override()
                    .unwrap_or(StatusCode::Ok);
                self.response.init(
                    self.ctx.resource_root(),
                    self.request.path(),
                    self.request.is_keep_alive(),
                    Some(code),
                );
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "bad request");
                self.reject();
            }
        }
    }

    /// Drops the buffered input and answers 400 without keep-alive.
    fn reject(&mut self) {
        self.read_buf.retrieve_all();
        self.response.init(
            self.ctx.resource_root(),
            "/400.html",
            false,
            Some(StatusCode::BadRequest),
        );
    }

    /// Unsent header and body bytes.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + self.response.file_len().saturating_sub(self.file_sent)
    }
}

impl<S> Connection<S> {
    /// Address of the remote end.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the queued response keeps the connection open.
    pub fn is_keep_alive(&self) -> bool {
        self.response.is_keep_alive()
    }

    /// Returns `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// Releases the mapped body, any unsent bytes and the socket. Only the
    /// first call has any effect on the live count.
    pub fn close(&mut self) {
        self.response.unmap_file();
        self.write_buf.retrieve_all();
        self.file_sent = 0;
        if self.stream.take().is_some() {
            let live = self.ctx.connection_closed();
            info!(peer = %self.peer, live, "client closed");
        }
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("pending_read", &self.read_buf.readable_bytes())
            .field("pending_head", &self.write_buf.readable_bytes())
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::ErrorKind::NotConnected.into()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::fs;

    /// In-memory socket: reads come from `input` in `read_chunk` pieces and
    /// then report `WouldBlock`; each write accepts the next scripted limit.
    #[derive(Default)]
    pub(crate) struct ScriptedStream {
        pub input: VecDeque<u8>,
        pub read_chunk: usize,
        pub eof: bool,
        pub write_limits: VecDeque<usize>,
        pub output: Vec<u8>,
        pub writes: usize,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return if self.eof {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(self.read_chunk).min(self.input.len());
            for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_vectored(&[IoSlice::new(buf)])
        }

        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let Some(mut limit) = self.write_limits.pop_front() else {
                return Err(io::ErrorKind::WouldBlock.into());
            };
            self.writes += 1;
            let mut n = 0;
            for buf in bufs {
                let take = buf.len().min(limit);
                self.output.extend_from_slice(&buf[..take]);
                limit -= take;
                n += take;
            }
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "0123456789".repeat(5)).unwrap();
        fs::write(dir.path().join("400.html"), "bad").unwrap();
        dir
    }

    fn connection(
        root: &std::path::Path,
        edge: bool,
        stream: ScriptedStream,
    ) -> (Arc<ServerContext>, Connection<ScriptedStream>) {
        let ctx = Arc::new(ServerContext::new(root, edge, None));
        let conn = Connection::new(stream, peer(), Arc::clone(&ctx));
        (ctx, conn)
    }

    fn request_stream(raw: &str) -> ScriptedStream {
        ScriptedStream {
            input: raw.bytes().collect(),
            read_chunk: 16,
            ..Default::default()
        }
    }

    #[test]
    fn edge_read_drains_socket() {
        let root = site();
        let raw = "GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let (_, mut conn) = connection(root.path(), true, request_stream(raw));
        let err = conn.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(conn.read_buf.readable_bytes(), raw.len());
    }

    #[test]
    fn level_read_reads_once() {
        let root = site();
        let raw = "GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let (_, mut conn) = connection(root.path(), false, request_stream(raw));
        assert_eq!(conn.read().unwrap(), 16);
        assert_eq!(conn.read_buf.readable_bytes(), 16);
    }

    #[test]
    fn peer_close_reads_zero() {
        let root = site();
        let stream = ScriptedStream {
            eof: true,
            ..Default::default()
        };
        let (_, mut conn) = connection(root.path(), true, stream);
        assert_eq!(conn.read().unwrap(), 0);
    }

    #[test]
    fn partial_writes_resume_without_loss() {
        let root = site();
        let raw = "GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let (_, mut conn) = connection(root.path(), false, request_stream(raw));
        while conn.read_buf.readable_bytes() < raw.len() {
            conn.read().unwrap();
        }
        assert!(conn.process());

        let head = String::from_utf8(conn.write_buf.peek().to_vec()).unwrap();
        let total = conn.to_write_bytes();
        assert_eq!(total, head.len() + 50);

        // First write stops inside the header, the second finishes everything.
        conn.stream.as_mut().unwrap().write_limits = VecDeque::from([40, total - 40]);
        assert_eq!(conn.write().unwrap(), 40);
        assert_eq!(conn.to_write_bytes(), total - 40);
        assert_eq!(conn.write().unwrap(), total - 40);
        assert_eq!(conn.to_write_bytes(), 0);

        let sent = &conn.stream.as_ref().unwrap().output;
        let expected = format!("{head}{}", "0123456789".repeat(5));
        assert_eq!(sent, expected.as_bytes());
        assert!(conn.is_keep_alive());
        assert!(!conn.process());
    }

    #[test]
    fn write_split_inside_body() {
        let root = site();
        let raw = "GET /index.html HTTP/1.1\r\n\r\n";
        let (_, mut conn) = connection(root.path(), false, request_stream(raw));
        while conn.read_buf.readable_bytes() < raw.len() {
            conn.read().unwrap();
        }
        assert!(conn.process());
        let head_len = conn.write_buf.readable_bytes();
        let total = conn.to_write_bytes();

        conn.stream.as_mut().unwrap().write_limits = VecDeque::from([head_len + 7, 20, 100]);
        conn.write().unwrap();
        assert_eq!(conn.file_sent, 7);
        assert_eq!(conn.write_buf.readable_bytes(), 0);
        conn.write().unwrap();
        conn.write().unwrap();
        assert_eq!(conn.to_write_bytes(), 0);
        assert_eq!(conn.stream.as_ref().unwrap().output.len(), total);
        assert!(!conn.is_keep_alive());
    }

    #[test]
    fn edge_write_stops_on_would_block() {
        let root = site();
        let raw = "GET / HTTP/1.1\r\n\r\n";
        let (_, mut conn) = connection(root.path(), true, request_stream(raw));
        let _ = conn.read();
        assert!(conn.process());
        let total = conn.to_write_bytes();

        conn.stream.as_mut().unwrap().write_limits = VecDeque::from([10, 10]);
        let err = conn.write().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(conn.to_write_bytes(), total - 20);
        assert_eq!(conn.stream.as_ref().unwrap().writes, 2);
    }

    #[test]
    fn malformed_request_gets_400_and_close() {
        let root = site();
        let (_, mut conn) = connection(root.path(), true, request_stream("GARBAGE\r\n\r\n"));
        let _ = conn.read();
        assert!(conn.process());
        assert_eq!(conn.response.code(), Some(StatusCode::BadRequest));
        assert!(!conn.is_keep_alive());
        assert_eq!(conn.read_buf.readable_bytes(), 0);
        assert!(conn.write_buf.peek().starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn oversized_request_gets_400_and_close() {
        let root = site();
        let mut raw = String::from("GET /");
        raw.push_str(&"a".repeat(MAX_REQUEST_SIZE + 100 * 1024));
        let stream = ScriptedStream {
            input: raw.bytes().collect(),
            read_chunk: 64 * 1024,
            ..Default::default()
        };
        let (_, mut conn) = connection(root.path(), true, stream);

        assert!(conn.read().unwrap() > 0);
        assert!(conn.read_buf.readable_bytes() > MAX_REQUEST_SIZE);
        assert!(!conn.stream.as_ref().unwrap().input.is_empty());

        assert!(conn.process());
        assert_eq!(conn.response.code(), Some(StatusCode::BadRequest));
        assert!(!conn.is_keep_alive());
        assert_eq!(conn.read_buf.readable_bytes(), 0);
    }

    #[test]
    fn close_drops_unsent_bytes() {
        let root = site();
        let raw = "GET /index.html HTTP/1.1\r\n\r\n";
        let (_, mut conn) = connection(root.path(), false, request_stream(raw));
        while conn.read_buf.readable_bytes() < raw.len() {
            conn.read().unwrap();
        }
        assert!(conn.process());
        let head_len = conn.write_buf.readable_bytes();
        conn.stream.as_mut().unwrap().write_limits = VecDeque::from([head_len + 7]);
        let _ = conn.write();
        assert_eq!(conn.file_sent, 7);

        conn.close();
        assert_eq!(conn.to_write_bytes(), 0);
    }

    #[test]
    fn close_is_idempotent_and_counted() {
        let root = site();
        let (ctx, mut conn) = connection(root.path(), true, ScriptedStream::default());
        assert_eq!(ctx.live_connections(), 1);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(ctx.live_connections(), 0);
        assert_eq!(conn.read().unwrap_err().kind(), io::ErrorKind::NotConnected);
        drop(conn);
        assert_eq!(ctx.live_connections(), 0);
    }
}
