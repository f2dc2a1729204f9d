//! HTTP/1.1 request parsing.
//!
//! [`HttpRequest`] is a line-driven state machine fed from a connection's
//! read [`ByteBuffer`]. The request line goes through [`httparse`]; headers
//! and the single-line form body are split by hand.

use std::collections::HashMap;

use bytes::Buf;
use thiserror::Error;
use tracing::{debug, warn};

use super::{Headers, Method, StatusCode};
use crate::buffer::ByteBuffer;
use crate::database::{CredentialError, CredentialPool};

const CRLF: &[u8] = b"\r\n";

/// Extension-less paths that are served from `<path>.html`.
const HTML_PAGES: &[&str] = &[
    "/index", "/register", "/welcome", "/video", "/picture", "/login",
];

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no request bytes available")]
    Empty,

    #[error("malformed request line: {0}")]
    RequestLine(#[from] httparse::Error),

    #[error("request line is missing method, target or version")]
    IncompleteRequestLine,
}

/// Where the parser is within the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
    Finished,
}

/// A request being parsed, and then the parsed request.
///
/// # Examples
///
/// ```
/// use rttpd::buffer::ByteBuffer;
/// use rttpd::http::{HttpRequest, Method};
///
/// let mut buf = ByteBuffer::default();
/// buf.append("GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
///
/// let mut request = HttpRequest::new();
/// request.parse(&mut buf, None).unwrap();
///
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.path(), "/index.html");
/// assert!(request.is_keep_alive());
/// assert_eq!(buf.readable_bytes(), 0);
/// ```
#[derive(Debug, Default)]
pub struct HttpRequest {
    state: ParseState,
    method: Method,
    path: String,
    /// The token after `HTTP/`, e.g. `1.1`.
    version: String,
    headers: Headers,
    body: String,
    form: HashMap<String, String>,
    /// Set when the request cannot be answered normally even though it parsed.
    status: Option<StatusCode>,
}

impl HttpRequest {
    /// Creates an empty request waiting for its request line.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all parsed state so the request can be reused for the next
    /// message on the same connection.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method = Method::Get;
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.form.clear();
        self.status = None;
    }

    /// Consumes lines from `buf` until the request is finished or no more
    /// input is available.
    ///
    /// Each line is removed from the buffer together with its CRLF; a final
    /// line without one runs to the end of the buffer. Login and registration
    /// forms are checked against `credentials`; with no pool the check is
    /// answered 503.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Empty`] if `buf` has nothing readable.
    /// - [`RequestError::RequestLine`] / [`RequestError::IncompleteRequestLine`]
    ///   if the first line is not `METHOD SP TARGET SP HTTP/<version>`.
    pub fn parse(
        &mut self,
        buf: &mut ByteBuffer,
        credentials: Option<&CredentialPool>,
    ) -> Result<(), RequestError> {
        if buf.readable_bytes() == 0 {
            return Err(RequestError::Empty);
        }

        while buf.readable_bytes() > 0 && self.state != ParseState::Finished {
            let (line_len, consumed) = match buf.find(CRLF) {
                Some(at) => (at, at + CRLF.len()),
                None => (buf.readable_bytes(), buf.readable_bytes()),
            };
            let raw = buf.copy_to_bytes(consumed);
            let line = String::from_utf8_lossy(&raw[..line_len]).into_owned();

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.normalize_path();
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    if !self.parse_header(&line) {
                        self.state = if buf.readable_bytes() > 0 && self.expects_body() {
                            ParseState::Body
                        } else {
                            ParseState::Finished
                        };
                    } else if buf.readable_bytes() <= CRLF.len() {
                        // Only the blank separator (or nothing) is left.
                        buf.retrieve_all();
                        self.state = ParseState::Finished;
                    }
                }
                ParseState::Body => {
                    self.body = line;
                    self.parse_form(credentials);
                    self.state = ParseState::Finished;
                }
                ParseState::Finished => break,
            }
        }

        debug!(
            method = %self.method,
            path = %self.path,
            version = %self.version,
            "parsed request"
        );
        Ok(())
    }

    /// Any version token is accepted; httparse only checks the method and
    /// target, fed as an HTTP/1.1 line with an empty header block.
    fn parse_request_line(&mut self, line: &str) -> Result<(), RequestError> {
        let Some((start, version)) = line
            .rsplit_once(' ')
            .and_then(|(start, token)| Some((start, token.strip_prefix("HTTP/")?)))
        else {
            warn!(line, "request line has no HTTP version");
            return Err(RequestError::IncompleteRequestLine);
        };

        let mut head = Vec::with_capacity(start.len() + 14);
        head.extend_from_slice(start.as_bytes());
        head.extend_from_slice(b" HTTP/1.1\r\n\r\n");

        let mut headers = [httparse::EMPTY_HEADER; 1];
        let mut raw = httparse::Request::new(&mut headers);
        if let Err(e) = raw.parse(&head) {
            warn!(line, error = %e, "malformed request line");
            return Err(e.into());
        }

        let (Some(method), Some(path)) = (raw.method, raw.path) else {
            return Err(RequestError::IncompleteRequestLine);
        };
        self.method = method.parse().unwrap_or_else(|never| match never {});
        self.path = path.to_owned();
        self.version = version.to_owned();
        Ok(())
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_owned();
        } else if HTML_PAGES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// Stores a `Key: Value` line; the name may be empty. Returns `false` for
    /// a line without a colon, which marks the end of the header block.
    fn parse_header(&mut self, line: &str) -> bool {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        self.headers.insert(name, value);
        true
    }

    /// Only a POST or a request declaring `Content-Length` owns the line after
    /// the header block; anything else there is the next request.
    fn expects_body(&self) -> bool {
        self.method == Method::Post || self.headers.contains("Content-Length")
    }

    fn parse_form(&mut self, credentials: Option<&CredentialPool>) {
        if self.method != Method::Post || self.headers.get("Content-Type") != Some(FORM_URLENCODED)
        {
            return;
        }
        self.form = decode_form(&self.body);

        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let username = self.form.get("username").map_or("", String::as_str);
        let password = self.form.get("password").map_or("", String::as_str);

        let outcome = match credentials {
            Some(pool) => pool.verify(username, password, is_login),
            None => Err(CredentialError::Unavailable),
        };
        match outcome {
            Ok(true) => self.path = "/welcome.html".to_owned(),
            Ok(false) => self.path = "/error.html".to_owned(),
            Err(e) => {
                warn!(path = %self.path, error = %e, "credential check failed");
                self.status = Some(StatusCode::ServiceUnavailable);
            }
        }
    }

    /// How far the last [`parse`](Self::parse) got.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The normalised request path, rewritten after a form check.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The version token as sent, without the `HTTP/` prefix.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// All headers of the request.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// A single header value, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The raw body line, empty when there was none.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// A decoded form field from a urlencoded POST body.
    pub fn form_field(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// Every decoded form field.
    pub fn form(&self) -> &HashMap<String, String> {
        &self.form
    }

    /// A status the response must use instead of the normal 200 track.
    pub fn status_override(&self) -> Option<StatusCode> {
        self.status
    }

    /// `Connection: keep-alive` on an HTTP/1.1 request.
    pub fn is_keep_alive(&self) -> bool {
        self.headers.get("Connection") == Some("keep-alive") && self.version == "1.1"
    }
}

/// Decodes an `application/x-www-form-urlencoded` body.
///
/// Pairs split on `&`, keys from values on the first `=`. A pair without `=`
/// maps to an empty value.
pub fn decode_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

/// Decodes `+` to a space and `%XX` to its byte. Decoding stops at a `%`
/// that is not followed by two hex digits.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    Some((hex_value(h[0])? << 4) | hex_value(h[1])?)
                });
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => break,
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
