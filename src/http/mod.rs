//! HTTP/1.1 protocol types, request parsing and response assembly.
//!
//! This module provides the protocol pieces a connection drives:
//! [`Method`], [`StatusCode`], [`Headers`], [`HttpRequest`] and
//! [`HttpResponse`], plus the suffix-to-MIME table in [`mime`].

use std::fmt;

pub mod headers;
pub mod mime;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::{HttpRequest, ParseState, RequestError};
pub use response::HttpResponse;

/// The response statuses the server produces.
///
/// # Examples
///
/// ```
/// use rttpd::http::StatusCode;
///
/// let status = StatusCode::NotFound;
/// assert_eq!(status.as_u16(), 404);
/// assert_eq!(status.canonical_reason(), "Not Found");
/// assert_eq!(status.error_page(), Some("/404.html"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    /// The credential store could not hand out a backend in time.
    ServiceUnavailable = 503,
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the canonical reason phrase for this status code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }

    /// The resource served in place of the requested path for error statuses.
    pub fn error_page(self) -> Option<&'static str> {
        match self {
            Self::Ok => None,
            Self::BadRequest => Some("/400.html"),
            Self::Forbidden => Some("/403.html"),
            Self::NotFound => Some("/404.html"),
            Self::ServiceUnavailable => Some("/503.html"),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

/// An HTTP request method.
///
/// Only `GET` and `POST` change what the server does; every other token is
/// kept so it can be logged and compared.
///
/// # Examples
///
/// ```
/// use rttpd::http::Method;
///
/// let method: Method = "POST".parse().unwrap();
/// assert_eq!(method, Method::Post);
/// assert_eq!(method.as_str(), "POST");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Head,
    Put,
    Delete,
    Options,
    Patch,
    /// Any other method token.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "HEAD" => Self::Head,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            other => Self::Custom(other.to_owned()),
        })
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
