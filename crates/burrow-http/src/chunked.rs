use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    parser::{is_token_byte, trim_whitespace},
    Request,
};

const MAX_LINE_LENGTH: usize = 8192;
const MAX_TRAILERS: usize = 100;
const FORBIDDEN_TRAILERS: [&str; 5] = ["te", "connection", "transfer-encoding", "content-length", "host"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("invalid chunk size line")]
    InvalidSize,
    #[error("chunk line too long")]
    LineTooLong,
    #[error("chunk data not terminated by crlf")]
    MissingCrlf,
    #[error("invalid trailer field")]
    InvalidTrailer,
    #[error("forbidden trailer field {0:?}")]
    ForbiddenTrailer(String),
    #[error("too many trailer fields")]
    TooManyTrailers,
    #[error("chunked body exceeds limit of {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("chunked body ended early")]
    Truncated,
}

impl ChunkError {
    pub fn status(&self) -> u16 {
        match self {
            ChunkError::TooLarge { .. } => 413,
            _ => 400,
        }
    }
}

/// Which part of the chunked grammar the decoder expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    Size,
    Data,
    Trailer,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decode {
    NeedMore,
    Complete,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    Trailer { count: usize },
    Done,
}

/// Incremental decoder for a chunked request body.
///
/// Each step only consumes from the input buffer once a whole unit (a size line, a chunk with
/// its CRLF, a trailer line) is available, so it can be called again with the same buffer after
/// more bytes arrive.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    body: BytesMut,
    limit: Option<u64>,
}

impl ChunkedDecoder {
    /// Create a decoder, rejecting bodies larger than `limit` bytes.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            state: ChunkState::Size,
            body: BytesMut::new(),
            limit,
        }
    }

    pub fn phase(&self) -> ChunkPhase {
        match self.state {
            ChunkState::Size => ChunkPhase::Size,
            ChunkState::Data { .. } => ChunkPhase::Data,
            ChunkState::Trailer { .. } => ChunkPhase::Trailer,
            ChunkState::Done => ChunkPhase::Done,
        }
    }

    /// Bytes of body decoded so far.
    pub fn decoded_len(&self) -> u64 {
        self.body.len() as u64
    }

    /// Decode as much of `buffer` as possible, consuming what was decoded.
    pub fn decode(&mut self, buffer: &mut BytesMut) -> Result<Decode, ChunkError> {
        loop {
            let progressed = match self.state {
                ChunkState::Size => self.read_size(buffer)?,
                ChunkState::Data { remaining } => self.read_data(buffer, remaining)?,
                ChunkState::Trailer { count } => self.read_trailer(buffer, count)?,
                ChunkState::Done => return Ok(Decode::Complete),
            };

            if !progressed {
                return Ok(Decode::NeedMore);
            }
        }
    }

    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }

    fn read_size(&mut self, buffer: &mut BytesMut) -> Result<bool, ChunkError> {
        let Some(length) = find_line(buffer, ChunkError::InvalidSize)? else {
            return Ok(false);
        };

        // Extensions are ignored
        let line = &buffer[..length];
        let size = match line.iter().position(|byte| *byte == b';') {
            Some(split) => &line[..split],
            None => line,
        };
        let size = parse_size(trim_whitespace(size))?;

        // Checked before any of the chunk is accepted, so many small chunks can't slip past
        if let Some(limit) = self.limit {
            let total = self.decoded_len().saturating_add(size);
            if total > limit {
                return Err(ChunkError::TooLarge { limit });
            }
        }

        buffer.advance(length + 2);
        self.state = if size == 0 {
            ChunkState::Trailer { count: 0 }
        } else {
            ChunkState::Data { remaining: size }
        };

        Ok(true)
    }

    fn read_data(&mut self, buffer: &mut BytesMut, remaining: u64) -> Result<bool, ChunkError> {
        let size = usize::try_from(remaining).map_err(|_| ChunkError::InvalidSize)?;
        let needed = size.checked_add(2).ok_or(ChunkError::InvalidSize)?;

        if buffer.len() < needed {
            return Ok(false);
        }
        if &buffer[size..needed] != b"\r\n" {
            return Err(ChunkError::MissingCrlf);
        }

        let data = buffer.split_to(size);
        self.body.extend_from_slice(&data);
        buffer.advance(2);
        self.state = ChunkState::Size;

        Ok(true)
    }

    fn read_trailer(&mut self, buffer: &mut BytesMut, count: usize) -> Result<bool, ChunkError> {
        let Some(length) = find_line(buffer, ChunkError::InvalidTrailer)? else {
            return Ok(false);
        };

        // Blank line ends the message
        if length == 0 {
            buffer.advance(2);
            self.state = ChunkState::Done;
            return Ok(true);
        }

        if count >= MAX_TRAILERS {
            return Err(ChunkError::TooManyTrailers);
        }
        validate_trailer(&buffer[..length])?;

        // Trailers are checked and dropped, never merged into the headers
        buffer.advance(length + 2);
        self.state = ChunkState::Trailer { count: count + 1 };

        Ok(true)
    }
}

/// Rebuild a chunked request as if it was sent with a `Content-Length`.
pub fn reconstruct(mut request: Request, body: Bytes) -> Request {
    let length = body.len() as u64;

    request.headers.remove("transfer-encoding");
    request.headers.set("Content-Length", length.to_string());
    request.content_length = Some(length);
    request.body = body;

    request
}

/// Find a CRLF terminated line, returning its length without the CRLF.
fn find_line(buffer: &[u8], malformed: ChunkError) -> Result<Option<usize>, ChunkError> {
    let Some(end) = buffer.iter().position(|byte| *byte == b'\n') else {
        if buffer.len() > MAX_LINE_LENGTH {
            return Err(ChunkError::LineTooLong);
        }
        return Ok(None);
    };

    if end > MAX_LINE_LENGTH {
        return Err(ChunkError::LineTooLong);
    }
    if end == 0 || buffer[end - 1] != b'\r' {
        return Err(malformed);
    }

    Ok(Some(end - 1))
}

fn parse_size(digits: &[u8]) -> Result<u64, ChunkError> {
    if digits.is_empty() {
        return Err(ChunkError::InvalidSize);
    }

    let mut size: u64 = 0;
    for byte in digits {
        let digit = (*byte as char).to_digit(16).ok_or(ChunkError::InvalidSize)?;
        size = size
            .checked_mul(16)
            .and_then(|size| size.checked_add(u64::from(digit)))
            .ok_or(ChunkError::InvalidSize)?;
    }

    Ok(size)
}

fn validate_trailer(line: &[u8]) -> Result<(), ChunkError> {
    let split = line
        .iter()
        .position(|byte| *byte == b':')
        .ok_or(ChunkError::InvalidTrailer)?;
    let name = &line[..split];
    let value = &line[split + 1..];

    if name.is_empty() || !name.iter().copied().all(is_token_byte) {
        return Err(ChunkError::InvalidTrailer);
    }
    if value.iter().any(|byte| matches!(byte, b'\r' | b'\n' | 0)) {
        return Err(ChunkError::InvalidTrailer);
    }

    let name = String::from_utf8_lossy(name).to_ascii_lowercase();
    if FORBIDDEN_TRAILERS.contains(&name.as_str()) {
        return Err(ChunkError::ForbiddenTrailer(name));
    }

    Ok(())
}
