//! Suffix to `Content-type` lookup.

const SUFFIX_TYPES: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/nsword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

/// Fallback for unknown or missing suffixes.
pub const DEFAULT_TYPE: &str = "text/plain";

/// Returns the MIME type for `path`, keyed on everything from its last `.`.
///
/// ```
/// use rttpd::http::mime::content_type;
///
/// assert_eq!(content_type("/index.html"), "text/html");
/// assert_eq!(content_type("/archive.tar.gz"), "application/x-gzip");
/// assert_eq!(content_type("/README"), "text/plain");
/// ```
pub fn content_type(path: &str) -> &'static str {
    let Some(dot) = path.rfind('.') else {
        return DEFAULT_TYPE;
    };
    let suffix = &path[dot..];
    SUFFIX_TYPES
        .iter()
        .find(|(s, _)| *s == suffix)
        .map_or(DEFAULT_TYPE, |(_, mime)| mime)
}
