use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

use crate::Headers;

/// Request methods the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Get, Method::Post, Method::Delete];

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }

    /// If a request with this method is expected to carry a body, and so needs a length.
    pub fn implies_body(&self) -> bool {
        matches!(self, Method::Post)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parsed request.
///
/// While the body is still arriving the same type carries just the head, with an empty `body`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request target exactly as received.
    pub uri: String,
    /// Percent-decoded path component of the target.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
    pub version: String,
    pub headers: Headers,
    /// The request was sent with `Transfer-Encoding: chunked`.
    pub chunked: bool,
    /// Declared `Content-Length`, `None` if absent.
    pub content_length: Option<u64>,
    pub body: Bytes,
    /// Connection the request arrived on.
    pub connection: Uuid,
}

impl Request {
    /// Path part of the target as received, still percent-encoded.
    pub fn raw_path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    /// If the client asked for the connection to be closed after this request.
    pub fn wants_close(&self) -> bool {
        self.headers
            .get("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
            })
            .unwrap_or(false)
    }
}
