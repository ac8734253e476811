use std::str;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::{reconstruct, ChunkError, ChunkedDecoder, Decode, Headers, Method, Request};

pub const MAX_URI_LENGTH: usize = 2048;
pub const MAX_HEADER_NAME_LENGTH: usize = 1024;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8000;
pub const MAX_HEADERS: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    RequestLine,
    #[error("unsupported method {0:?}")]
    UnsupportedMethod(String),
    #[error("request target too long")]
    UriTooLong,
    #[error("invalid request target")]
    InvalidUri,
    #[error("invalid query string")]
    InvalidQuery,
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),
    #[error("line not terminated by crlf")]
    BareLineFeed,
    #[error("malformed header line")]
    HeaderLine,
    #[error("folded header line")]
    HeaderFolding,
    #[error("too many header fields")]
    TooManyHeaders,
    #[error("invalid header name")]
    HeaderName,
    #[error("header field too large")]
    HeaderTooLarge,
    #[error("invalid header value")]
    HeaderValue,
    #[error("duplicate header {0:?}")]
    DuplicateHeader(String),
    #[error("unsupported transfer encoding")]
    TransferEncoding,
    #[error("invalid content length")]
    ContentLength,
    #[error("both content length and chunked transfer encoding given")]
    AmbiguousLength,
    #[error("missing host header")]
    MissingHost,
    #[error("request head too large")]
    HeadTooLarge,
    #[error("request head not terminated")]
    UnterminatedHead,
    #[error("body shorter than content length")]
    BodyTruncated,
    #[error("more data than the declared body")]
    BodyOverflow,
    #[error("body length required")]
    LengthRequired,
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

impl ParseError {
    /// Status code the failure is answered with.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::UnsupportedMethod(_) => 501,
            ParseError::UriTooLong => 414,
            ParseError::UnsupportedVersion(_) => 505,
            ParseError::LengthRequired => 411,
            ParseError::Chunk(error) => error.status(),
            _ => 400,
        }
    }
}

/// Incremental search for the end of a request head.
///
/// Remembers how far it got, so feeding a growing buffer never re-scans bytes.
#[derive(Default, Debug, Clone)]
pub struct HeadScanner {
    scanned: usize,
    line_start: usize,
}

impl HeadScanner {
    /// Scan `buffer` for the blank line ending the head.
    ///
    /// Returns the length of the head, including the blank line, once found. The buffer passed
    /// in must start at the same position every call.
    pub fn scan(&mut self, buffer: &[u8]) -> Result<Option<usize>, ParseError> {
        while self.scanned < buffer.len() {
            let i = self.scanned;
            self.scanned += 1;

            if buffer[i] != b'\n' {
                continue;
            }

            // Every line must end in CRLF
            if i == self.line_start || buffer[i - 1] != b'\r' {
                return Err(ParseError::BareLineFeed);
            }

            let start = self.line_start;
            self.line_start = i + 1;

            // A line holding only CRLF ends the head
            if i - 1 == start {
                if start == 0 {
                    return Err(ParseError::RequestLine);
                }

                return Ok(Some(i + 1));
            }
        }

        Ok(None)
    }

    pub fn reset(&mut self) {
        self.scanned = 0;
        self.line_start = 0;
    }
}

/// Parse a complete request head, ending in the blank line.
///
/// The returned request has no body yet, and a nil connection id.
pub fn parse_head(head: &[u8]) -> Result<Request, ParseError> {
    // Drop the blank line, keeping the CRLF of the last field line
    if !head.ends_with(b"\r\n\r\n") {
        return Err(ParseError::UnterminatedHead);
    }
    let lines = split_lines(&head[..head.len() - 2])?;

    let (request_line, field_lines) = lines.split_first().ok_or(ParseError::RequestLine)?;
    let line = parse_request_line(request_line)?;

    let mut headers = Headers::new();
    for field_line in field_lines {
        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::TooManyHeaders);
        }

        let (name, value) = parse_field_line(field_line)?;
        if headers.contains(&name) {
            return Err(ParseError::DuplicateHeader(name));
        }
        headers.append(name, value);
    }

    // Body framing
    let chunked = match headers.get("transfer-encoding") {
        None => false,
        Some("chunked") => true,
        Some(_) => return Err(ParseError::TransferEncoding),
    };
    let content_length = headers
        .get("content-length")
        .map(parse_content_length)
        .transpose()?;

    if chunked && content_length.is_some() {
        return Err(ParseError::AmbiguousLength);
    }

    if !headers.contains("host") {
        return Err(ParseError::MissingHost);
    }

    Ok(Request {
        method: line.method,
        uri: line.uri,
        path: line.path,
        query: line.query,
        version: line.version,
        headers,
        chunked,
        content_length,
        body: Bytes::new(),
        connection: Uuid::nil(),
    })
}

/// Parse a complete request message in one go, head and body.
///
/// Chunked bodies are decoded and the request reconstructed as if it was sent with a
/// `Content-Length`.
pub fn parse_request(data: &[u8]) -> Result<Request, ParseError> {
    let mut scanner = HeadScanner::default();
    let head_length = scanner.scan(data)?.ok_or(ParseError::UnterminatedHead)?;

    let request = parse_head(&data[..head_length])?;
    let rest = &data[head_length..];

    if request.chunked {
        let mut buffer = BytesMut::from(rest);
        let mut decoder = ChunkedDecoder::new(None);

        if let Decode::NeedMore = decoder.decode(&mut buffer)? {
            return Err(ChunkError::Truncated.into());
        }
        if !buffer.is_empty() {
            return Err(ParseError::BodyOverflow);
        }

        return Ok(reconstruct(request, decoder.into_body()));
    }

    let mut request = request;
    match request.content_length {
        Some(length) => {
            let length = usize::try_from(length).map_err(|_| ParseError::ContentLength)?;
            if rest.len() < length {
                return Err(ParseError::BodyTruncated);
            }
            if rest.len() > length {
                return Err(ParseError::BodyOverflow);
            }

            request.body = Bytes::copy_from_slice(rest);
        }
        None => {
            if request.method.implies_body() {
                return Err(ParseError::LengthRequired);
            }
            if !rest.is_empty() {
                return Err(ParseError::BodyOverflow);
            }
        }
    }

    Ok(request)
}

struct RequestLine {
    method: Method,
    uri: String,
    path: String,
    query: String,
    version: String,
}

fn split_lines(data: &[u8]) -> Result<Vec<&[u8]>, ParseError> {
    let mut lines = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let end = rest
            .iter()
            .position(|byte| *byte == b'\n')
            .ok_or(ParseError::UnterminatedHead)?;
        let line = rest[..end]
            .strip_suffix(b"\r")
            .ok_or(ParseError::BareLineFeed)?;

        lines.push(line);
        rest = &rest[end + 1..];
    }

    Ok(lines)
}

fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    // Exactly three parts separated by single spaces
    let mut parts = line.split(|byte| *byte == b' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::RequestLine);
    };

    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ParseError::RequestLine);
    }
    if line.iter().any(|byte| matches!(byte, b'\r' | b'\n' | 0)) {
        return Err(ParseError::RequestLine);
    }

    let method = str::from_utf8(method)
        .ok()
        .and_then(Method::parse)
        .ok_or_else(|| ParseError::UnsupportedMethod(String::from_utf8_lossy(method).into()))?;

    if target.len() > MAX_URI_LENGTH {
        return Err(ParseError::UriTooLong);
    }

    // Only origin-form targets are served
    if target[0] != b'/' {
        return Err(ParseError::InvalidUri);
    }

    let (raw_path, raw_query) = match target.iter().position(|byte| *byte == b'?') {
        Some(split) => (&target[..split], &target[split + 1..]),
        None => (target, &target[target.len()..]),
    };

    let path = percent_decode(raw_path, ParseError::InvalidUri)?;
    let path = String::from_utf8(path).map_err(|_| ParseError::InvalidUri)?;
    percent_decode(raw_query, ParseError::InvalidQuery)?;

    if version != b"HTTP/1.1" {
        return Err(ParseError::UnsupportedVersion(
            String::from_utf8_lossy(version).into(),
        ));
    }

    // Validation above rejected everything but printable ASCII
    let uri = String::from_utf8_lossy(target).into_owned();
    let query = String::from_utf8_lossy(raw_query).into_owned();

    Ok(RequestLine {
        method,
        uri,
        path,
        query,
        version: "HTTP/1.1".to_string(),
    })
}

fn percent_decode(raw: &[u8], error: ParseError) -> Result<Vec<u8>, ParseError> {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        let byte = raw[i];

        if is_forbidden_target_byte(byte) {
            return Err(error);
        }

        if byte != b'%' {
            decoded.push(byte);
            i += 1;
            continue;
        }

        let high = raw.get(i + 1).copied().and_then(hex_value);
        let low = raw.get(i + 2).copied().and_then(hex_value);
        let (Some(high), Some(low)) = (high, low) else {
            return Err(error);
        };

        let value = (high << 4) | low;
        if value <= 0x1F || value == 0x7F {
            return Err(error);
        }

        decoded.push(value);
        i += 3;
    }

    Ok(decoded)
}

fn is_forbidden_target_byte(byte: u8) -> bool {
    byte <= 0x20 || byte >= 0x7F || byte == b'"' || byte == b'\\'
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn parse_field_line(line: &[u8]) -> Result<(String, String), ParseError> {
    if matches!(line.first(), Some(b'\t' | b' ')) {
        return Err(ParseError::HeaderFolding);
    }

    let split = line
        .iter()
        .position(|byte| *byte == b':')
        .ok_or(ParseError::HeaderLine)?;
    let name = &line[..split];
    let value = trim_whitespace(&line[split + 1..]);

    if name.len() > MAX_HEADER_NAME_LENGTH || value.len() > MAX_HEADER_VALUE_LENGTH {
        return Err(ParseError::HeaderTooLarge);
    }
    if name.is_empty() || !name.iter().copied().all(is_token_byte) {
        return Err(ParseError::HeaderName);
    }

    // CR, LF and NUL could split the message, anything outside printable ASCII but tab is
    // rejected along with them
    if value
        .iter()
        .any(|byte| (*byte < 0x20 && *byte != b'\t') || *byte >= 0x7F)
    {
        return Err(ParseError::HeaderValue);
    }

    let name = str::from_utf8(name).map_err(|_| ParseError::HeaderName)?;
    let value = str::from_utf8(value).map_err(|_| ParseError::HeaderValue)?;

    Ok((name.to_string(), value.to_string()))
}

pub(crate) fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

pub(crate) fn trim_whitespace(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn parse_content_length(value: &str) -> Result<u64, ParseError> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ParseError::ContentLength);
    }

    value.parse().map_err(|_| ParseError::ContentLength)
}
