use std::{mem, rc::Rc};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{event, Level};
use uuid::Uuid;

use crate::{
    parse_head, reconstruct, route, validate, ChunkPhase, ChunkedDecoder, Decode, HeadScanner,
    ParseError, Rejection, Request, Response, Route, RouteError, ServerConfig,
};

/// The one active phase of reading a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ReadingHeaders,
    ReadingBody,
    ReadingChunkSize,
    ReadingChunkData,
    ReadingTrailer,
    Complete,
}

/// A complete request, with the location it was routed to.
#[derive(Debug)]
pub struct Routed {
    pub request: Request,
    pub route: Route,
}

#[derive(Debug)]
pub enum Advance {
    /// More bytes are needed.
    Pending,
    /// A request is complete and passed validation.
    Ready(Box<Routed>),
    /// The request was refused, the connection must close after the response.
    Rejected(Response),
}

enum State {
    ReadingHeaders,
    ReadingBody { body: BytesMut, length: usize },
    ReadingChunks(ChunkedDecoder),
    Complete,
}

#[derive(Error, Debug)]
enum Failure {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("refused by location with status {}", .0.status())]
    Rejected(Rejection),
    #[error("request head lost before completion")]
    Internal,
}

impl From<Rejection> for Failure {
    fn from(rejection: Rejection) -> Self {
        Failure::Rejected(rejection)
    }
}

/// Per-connection request reader.
///
/// Bytes can be fed in any split, the machine re-evaluates after every feed and only moves
/// forward once enough of the message is buffered.
pub struct RequestMachine {
    id: Uuid,
    server: Rc<ServerConfig>,
    max_head_size: usize,

    state: State,
    buffer: BytesMut,
    scanner: HeadScanner,
    head: Option<(Request, Route)>,
}

impl RequestMachine {
    pub fn new(id: Uuid, server: Rc<ServerConfig>, max_head_size: usize) -> Self {
        Self {
            id,
            server,
            max_head_size,

            state: State::ReadingHeaders,
            buffer: BytesMut::new(),
            scanner: HeadScanner::default(),
            head: None,
        }
    }

    pub fn server(&self) -> &Rc<ServerConfig> {
        &self.server
    }

    pub fn phase(&self) -> Phase {
        match &self.state {
            State::ReadingHeaders => Phase::ReadingHeaders,
            State::ReadingBody { .. } => Phase::ReadingBody,
            State::ReadingChunks(decoder) => match decoder.phase() {
                ChunkPhase::Size => Phase::ReadingChunkSize,
                ChunkPhase::Data => Phase::ReadingChunkData,
                ChunkPhase::Trailer => Phase::ReadingTrailer,
                ChunkPhase::Done => Phase::Complete,
            },
            State::Complete => Phase::Complete,
        }
    }

    /// Bytes buffered and not yet part of a request.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        match &mut self.state {
            State::ReadingBody { body, .. } => body.extend_from_slice(data),
            _ => self.buffer.extend_from_slice(data),
        }
    }

    /// Move the machine forward as far as the buffered bytes allow.
    pub fn advance(&mut self) -> Advance {
        match self.try_advance() {
            Ok(advance) => advance,
            Err(failure) => {
                let response = self.failure_response(&failure);
                event!(
                    Level::WARN,
                    connection = %self.id,
                    status = response.status,
                    reason = %failure,
                    "request rejected"
                );

                self.state = State::Complete;
                self.head = None;
                Advance::Rejected(response)
            }
        }
    }

    /// Start reading the next request, keeping bytes that already arrived for it.
    pub fn reset(&mut self) {
        self.state = State::ReadingHeaders;
        self.scanner.reset();
        self.head = None;
    }

    fn try_advance(&mut self) -> Result<Advance, Failure> {
        loop {
            match mem::replace(&mut self.state, State::Complete) {
                State::ReadingHeaders => {
                    let Some(length) = self.scanner.scan(&self.buffer)? else {
                        if self.buffer.len() > self.max_head_size {
                            return Err(ParseError::HeadTooLarge.into());
                        }

                        self.state = State::ReadingHeaders;
                        return Ok(Advance::Pending);
                    };

                    if length > self.max_head_size {
                        return Err(ParseError::HeadTooLarge.into());
                    }

                    let head = self.buffer.split_to(length);
                    self.state = self.begin(&head)?;
                }
                State::ReadingBody { body, length } => {
                    if body.len() < length {
                        self.state = State::ReadingBody { body, length };
                        return Ok(Advance::Pending);
                    }
                    if body.len() > length {
                        return Err(ParseError::BodyOverflow.into());
                    }

                    return self.complete(body.freeze());
                }
                State::ReadingChunks(mut decoder) => match decoder.decode(&mut self.buffer) {
                    Ok(Decode::NeedMore) => {
                        self.state = State::ReadingChunks(decoder);
                        return Ok(Advance::Pending);
                    }
                    Ok(Decode::Complete) => {
                        if !self.buffer.is_empty() {
                            return Err(ParseError::BodyOverflow.into());
                        }

                        return self.complete(decoder.into_body());
                    }
                    Err(error) => return Err(ParseError::from(error).into()),
                },
                State::Complete => return Ok(Advance::Pending),
            }
        }
    }

    /// Parse, route and validate a request head, returning the state reading its body.
    fn begin(&mut self, head: &[u8]) -> Result<State, Failure> {
        let mut request = parse_head(head)?;
        request.connection = self.id;

        let route = route(&self.server, &request.path)?;
        let location = self
            .server
            .location(route.location)
            .ok_or(RouteError::NoLocation)?;
        validate(&request, location)?;

        event!(
            Level::DEBUG,
            connection = %self.id,
            method = %request.method,
            path = %request.path,
            location = location.path(),
            "request head parsed"
        );

        let state = if request.chunked {
            State::ReadingChunks(ChunkedDecoder::new(location.body_limit()))
        } else {
            let length = request.content_length.unwrap_or(0);
            let length = usize::try_from(length).map_err(|_| ParseError::ContentLength)?;

            // Anything buffered past the head is body
            let body = self.buffer.split();
            State::ReadingBody { body, length }
        };

        self.head = Some((request, route));
        Ok(state)
    }

    fn complete(&mut self, body: Bytes) -> Result<Advance, Failure> {
        let (mut request, route) = self.head.take().ok_or(Failure::Internal)?;

        if request.chunked {
            request = reconstruct(request, body);
        } else {
            request.body = body;
        }

        self.state = State::Complete;
        Ok(Advance::Ready(Box::new(Routed { request, route })))
    }

    fn failure_response(&self, failure: &Failure) -> Response {
        match failure {
            Failure::Parse(error) => Response::error(error.status(), &self.server),
            Failure::Route(error) => Response::error(error.status(), &self.server),
            Failure::Rejected(rejection) => rejection.clone().into_response(&self.server),
            Failure::Internal => Response::error(500, &self.server),
        }
    }
}
