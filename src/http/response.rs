//! HTTP/1.1 response builder.
//!
//! [`HttpResponse`] classifies the requested resource, writes the status line
//! and headers into the connection's write buffer, and memory-maps the file
//! body. The body bytes never enter the buffer: the connection sends them
//! straight from the mapping with a vectored write.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use super::{StatusCode, mime};
use crate::buffer::ByteBuffer;

/// "Other" read permission bit.
const OTHER_READ: u32 = 0o004;

const KEEP_ALIVE_HINT: &str = "keep-alive: max=6, timeout=120\r\n";

/// A response under construction for one request.
///
/// # Examples
///
/// ```
/// use rttpd::buffer::ByteBuffer;
/// use rttpd::http::{HttpResponse, StatusCode};
///
/// let root = tempfile::tempdir().unwrap();
/// let mut response = HttpResponse::new();
/// response.init(root.path(), "/missing.html", false, None);
///
/// let mut buf = ByteBuffer::default();
/// response.make_response(&mut buf);
///
/// assert_eq!(response.code(), Some(StatusCode::NotFound));
/// let head = buf.retrieve_all_as_string();
/// assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
/// assert!(head.contains("File NotFound!"));
/// ```
#[derive(Debug, Default)]
pub struct HttpResponse {
    code: Option<StatusCode>,
    keep_alive: bool,
    path: String,
    root: PathBuf,
    file: Option<Mmap>,
}

impl HttpResponse {
    /// Creates an empty response with nothing mapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the response for a new request, releasing any mapped file.
    ///
    /// `code` pre-sets the status; `None` lets [`make_response`](Self::make_response)
    /// classify the resource.
    pub fn init(
        &mut self,
        root: impl Into<PathBuf>,
        path: impl Into<String>,
        keep_alive: bool,
        code: Option<StatusCode>,
    ) {
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path.into();
        self.root = root.into();
    }

    /// Writes the status line and headers into `buf` and maps the body.
    ///
    /// When the body file cannot be opened an inline HTML error page is
    /// appended to `buf` instead.
    pub fn make_response(&mut self, buf: &mut ByteBuffer) {
        let code = self.classify();
        self.code = Some(code);
        if let Some(page) = code.error_page() {
            self.path = page.to_owned();
        }

        buf.append(format!(
            "HTTP/1.1 {} {}\r\n",
            code.as_u16(),
            code.canonical_reason()
        ));
        self.append_headers(buf);
        self.append_content(buf);
    }

    fn classify(&self) -> StatusCode {
        if escapes_root(&self.path) {
            return StatusCode::Forbidden;
        }
        match fs::metadata(self.target()) {
            Err(_) => StatusCode::NotFound,
            Ok(meta) if meta.is_dir() => StatusCode::NotFound,
            Ok(meta) if meta.permissions().mode() & OTHER_READ == 0 => StatusCode::Forbidden,
            Ok(_) => self.code.unwrap_or(StatusCode::Ok),
        }
    }

    fn append_headers(&self, buf: &mut ByteBuffer) {
        if self.keep_alive {
            buf.append("Connection: keep-alive\r\n");
            buf.append(KEEP_ALIVE_HINT);
        } else {
            buf.append("Connection: close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", mime::content_type(&self.path)));
    }

    fn append_content(&mut self, buf: &mut ByteBuffer) {
        let file = match File::open(self.target()) {
            Ok(file) => file,
            Err(_) => return self.error_content(buf, "File NotFound!"),
        };
        let len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => return self.error_content(buf, "File NotFound!"),
        };

        if len > 0 {
            // SAFETY: the mapping is read-only and served files are not
            // truncated while the server runs.
            match unsafe { Mmap::map(&file) } {
                Ok(map) => self.file = Some(map),
                Err(_) => return self.error_content(buf, "File NotFound!"),
            }
        }
        debug!(path = %self.path, len, "mapped response body");
        buf.append(format!("Content-length: {len}\r\n\r\n"));
    }

    /// Appends `Content-length` and a small generated HTML page describing
    /// the current status.
    pub fn error_content(&self, buf: &mut ByteBuffer, message: &str) {
        let code = self.code.unwrap_or(StatusCode::BadRequest);
        let mut body = String::with_capacity(160);
        body.push_str("<html><title>Error</title>");
        body.push_str("<body bgcolor=\"ffffff\">");
        let _ = writeln!(body, "{} : {}", code.as_u16(), code.canonical_reason());
        let _ = write!(body, "<p>{message}</p>");
        body.push_str("<hr><em>rttpd</em></body></html>");

        buf.append(format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append(body);
    }

    /// Releases the mapped body, if any.
    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    /// The mapped body bytes.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_deref()
    }

    /// Length of the mapped body, zero when none is mapped.
    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, |m| m.len())
    }

    /// The status chosen by the last `make_response`.
    pub fn code(&self) -> Option<StatusCode> {
        self.code
    }

    /// The resource actually served, after any error-page rewrite.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the response asks to keep the connection open.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn target(&self) -> PathBuf {
        self.root.join(self.path.trim_start_matches('/'))
    }
}

fn escapes_root(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;

    fn resources() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(dir.path().join("404.html"), "gone").unwrap();
        fs::write(dir.path().join("403.html"), "nope").unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        dir
    }

    fn build(root: &Path, path: &str, keep_alive: bool, code: Option<StatusCode>) -> (HttpResponse, String) {
        let mut response = HttpResponse::new();
        response.init(root, path, keep_alive, code);
        let mut buf = ByteBuffer::default();
        response.make_response(&mut buf);
        let head = buf.retrieve_all_as_string();
        (response, head)
    }

    #[test]
    fn existing_file_is_mapped_not_copied() {
        let root = resources();
        let (response, head) = build(root.path(), "/index.html", true, None);
        assert_eq!(response.code(), Some(StatusCode::Ok));
        assert_eq!(
            head,
            "HTTP/1.1 200 OK\r\n\
             Connection: keep-alive\r\n\
             keep-alive: max=6, timeout=120\r\n\
             Content-type: text/html\r\n\
             Content-length: 13\r\n\r\n"
        );
        assert_eq!(response.file(), Some(&b"<h1>home</h1>"[..]));
    }

    #[test]
    fn missing_file_serves_404_page() {
        let root = resources();
        let (response, head) = build(root.path(), "/nothing.png", false, None);
        assert_eq!(response.code(), Some(StatusCode::NotFound));
        assert_eq!(response.path(), "/404.html");
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert_eq!(response.file(), Some(&b"gone"[..]));
    }

    #[test]
    fn directory_is_not_found() {
        let root = resources();
        let (response, _) = build(root.path(), "/sub", false, None);
        assert_eq!(response.code(), Some(StatusCode::NotFound));
    }

    #[test]
    fn missing_error_page_falls_back_to_inline_body() {
        let root = resources();
        let (response, head) = build(root.path(), "/x", false, Some(StatusCode::BadRequest));
        assert_eq!(response.code(), Some(StatusCode::NotFound));
        fs::remove_file(root.path().join("404.html")).unwrap();
        let (response, head2) = build(root.path(), "/x", false, None);
        assert!(response.file().is_none());
        assert!(head.contains("Content-length: 4\r\n"));
        let body = head2.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(
            body,
            "<html><title>Error</title><body bgcolor=\"ffffff\">404 : Not Found\n\
             <p>File NotFound!</p><hr><em>rttpd</em></body></html>"
        );
        assert!(head2.contains(&format!("Content-length: {}\r\n", body.len())));
    }

    #[test]
    fn preset_code_survives_when_file_exists() {
        let root = resources();
        let (response, head) = build(root.path(), "/index.html", false, Some(StatusCode::BadRequest));
        assert_eq!(response.code(), Some(StatusCode::BadRequest));
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        // No 400.html in this root.
        assert!(head.contains("<p>File NotFound!</p>"));
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let root = resources();
        let secret = root.path().join("secret.html");
        fs::write(&secret, "s").unwrap();
        fs::set_permissions(&secret, Permissions::from_mode(0o640)).unwrap();
        let (response, _) = build(root.path(), "/secret.html", false, None);
        assert_eq!(response.code(), Some(StatusCode::Forbidden));
        assert_eq!(response.file(), Some(&b"nope"[..]));
    }

    #[test]
    fn parent_segments_are_forbidden() {
        let root = resources();
        let (response, _) = build(&root.path().join("sub"), "/../index.html", false, None);
        assert_eq!(response.code(), Some(StatusCode::Forbidden));
    }

    #[test]
    fn empty_file_has_zero_length_and_no_mapping() {
        let root = resources();
        let (response, head) = build(root.path(), "/empty.txt", false, None);
        assert_eq!(response.code(), Some(StatusCode::Ok));
        assert!(head.ends_with("Content-type: text/plain\r\nContent-length: 0\r\n\r\n"));
        assert_eq!(response.file_len(), 0);
    }

    #[test]
    fn init_releases_previous_mapping() {
        let root = resources();
        let (mut response, _) = build(root.path(), "/index.html", false, None);
        assert_eq!(response.file_len(), 13);
        response.init(root.path(), "/index.html", false, None);
        assert!(response.file().is_none());
        assert_eq!(response.code(), None);
    }
}
