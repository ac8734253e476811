use std::{fs, path::Path};

use bytes::{BufMut, Bytes, BytesMut};
use html_escape::{encode_double_quoted_attribute, encode_text};
use tracing::{event, Level};

use crate::{content_type, reason_phrase, status::is_bodiless, Headers, ServerConfig};

/// A response ready to be written to a client.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Create an empty response with the standard reason phrase.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Set the body, along with its `Content-Type` and `Content-Length`.
    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        let body = body.into();

        self.headers.set("Content-Type", content_type);
        self.headers.set("Content-Length", body.len().to_string());
        self.body = body;

        self
    }

    /// Error response, using the virtual host's custom page for the code if it can be loaded.
    pub fn error(status: u16, server: &ServerConfig) -> Self {
        let Some(path) = server.error_page(status) else {
            return Self::default_error(status);
        };

        match fs::read(path) {
            Ok(page) => Self::new(status).with_body(content_type(path), page),
            Err(error) => {
                event!(
                    Level::WARN,
                    ?error,
                    path = ?path,
                    "failed to load custom error page"
                );
                Self::default_error(status)
            }
        }
    }

    /// Error response with a generated page.
    pub fn default_error(status: u16) -> Self {
        let reason = reason_phrase(status);
        let page = format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n<body>\n\
             <h1>Error {status}: {reason}</h1>\n<hr>\n<p>burrow</p>\n</body>\n</html>\n"
        );

        Self::new(status).with_body("text/html", page)
    }

    /// Redirect to `target`.
    pub fn redirect(status: u16, target: &str) -> Self {
        let page = format!(
            "<!DOCTYPE html>\n<html>\n<head><title>Redirecting</title></head>\n<body>\n\
             <p>Redirecting to <a href=\"{}\">{}</a></p>\n</body>\n</html>\n",
            encode_double_quoted_attribute(target),
            encode_text(target),
        );

        Self::new(status)
            .with_header("Location", target)
            .with_body("text/html", page)
    }

    /// Static file content.
    pub fn file(path: &Path, content: Vec<u8>) -> Self {
        Self::new(200).with_body(content_type(path), content)
    }

    /// Make sure the response is delimited, so the connection can be reused after it.
    pub(crate) fn frame(&mut self) {
        if is_bodiless(self.status) {
            self.headers.remove("content-length");
            self.body = Bytes::new();
            return;
        }

        if !self.headers.contains("content-length") {
            self.headers
                .set("Content-Length", self.body.len().to_string());
        }
    }

    /// Render to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut data = BytesMut::new();

        data.put_slice(b"HTTP/1.1 ");
        data.put_slice(self.status.to_string().as_bytes());
        data.put_u8(b' ');
        data.put_slice(self.reason.as_bytes());
        data.put_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            data.put_slice(name.as_bytes());
            data.put_slice(b": ");
            data.put_slice(value.as_bytes());
            data.put_slice(b"\r\n");
        }
        data.put_slice(b"\r\n");

        data.put_slice(&self.body);

        data.freeze()
    }
}
