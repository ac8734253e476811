use std::{
    io,
    net::SocketAddr,
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use burrow_mio::{read_bounded, write_available, ReadOutcome};
use mio::{net::TcpStream, Token};
use thiserror::Error;
use thunderdome::Index;
use tracing::{event, Level};
use uuid::Uuid;

use crate::{Advance, Phase, RequestMachine, Response, ServerConfig, ServerOptions};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrepareError {
    #[error("a response is already pending on the connection")]
    AlreadyPending,
}

/// Progress of writing the pending response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Partial,
    Done,
}

/// An accepted client socket and its exchange state.
pub struct Connection {
    id: Uuid,
    stream: TcpStream,
    token: Option<Token>,
    peer: SocketAddr,

    machine: RequestMachine,
    last_activity: Instant,
    served: u64,

    outgoing: Option<Outgoing>,
    should_close: bool,
    gateway: Option<Index>,
    unread: bool,
}

struct Outgoing {
    data: Bytes,
    written: usize,
    status: u16,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        server: Rc<ServerConfig>,
        options: &ServerOptions,
    ) -> Self {
        let id = Uuid::new_v4();

        Self {
            id,
            stream,
            token: None,
            peer,

            machine: RequestMachine::new(id, server, options.max_head_size),
            last_activity: Instant::now(),
            served: 0,

            outgoing: None,
            should_close: false,
            gateway: None,
            unread: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn set_token(&mut self, token: Token) {
        self.token = Some(token);
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn server(&self) -> &Rc<ServerConfig> {
        self.machine.server()
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn should_close(&self) -> bool {
        self.should_close
    }

    pub fn gateway(&self) -> Option<Index> {
        self.gateway
    }

    pub fn set_gateway(&mut self, gateway: Option<Index>) {
        self.gateway = gateway;
    }

    /// Close the connection once the current exchange is answered.
    pub fn request_close(&mut self) {
        self.should_close = true;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// The last receive stopped at its limit, so the socket may hold data without a new
    /// readiness event coming for it.
    pub fn has_unread(&self) -> bool {
        self.unread
    }

    /// Read up to `limit` bytes from the socket into the request machine.
    pub fn receive(&mut self, chunk: usize, limit: usize) -> io::Result<ReadOutcome> {
        let mut incoming = BytesMut::new();
        let outcome = read_bounded(&mut self.stream, &mut incoming, chunk, limit)?;
        self.unread = outcome.limited;

        if outcome.bytes > 0 {
            event!(Level::TRACE, connection = %self.id, bytes = outcome.bytes, "received data");
            self.machine.feed(&incoming);
            self.touch(Instant::now());
        }

        Ok(outcome)
    }

    pub fn advance(&mut self) -> Advance {
        self.machine.advance()
    }

    pub fn has_pending_response(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Queue a response for writing.
    ///
    /// When `close` is set, or a close was requested earlier, the response announces it and the
    /// connection closes once it's flushed.
    pub fn prepare(&mut self, mut response: Response, close: bool) -> Result<(), PrepareError> {
        if self.outgoing.is_some() {
            return Err(PrepareError::AlreadyPending);
        }

        let close = close || self.should_close;
        if close {
            self.should_close = true;
            response.headers.set("Connection", "close");
        }
        response.frame();

        event!(
            Level::INFO,
            connection = %self.id,
            status = response.status,
            bytes = response.body.len(),
            close,
            "response prepared"
        );

        self.outgoing = Some(Outgoing {
            data: response.to_bytes(),
            written: 0,
            status: response.status,
        });

        Ok(())
    }

    /// Write as much of the pending response as the socket accepts.
    pub fn flush(&mut self) -> io::Result<Flush> {
        let Some(outgoing) = self.outgoing.as_mut() else {
            return Ok(Flush::Done);
        };

        let written = write_available(&mut self.stream, &outgoing.data[outgoing.written..])?;
        outgoing.written += written;

        if written > 0 {
            self.last_activity = Instant::now();
        }

        if outgoing.written < outgoing.data.len() {
            return Ok(Flush::Partial);
        }

        event!(
            Level::DEBUG,
            connection = %self.id,
            status = outgoing.status,
            bytes = outgoing.data.len(),
            "response flushed"
        );
        Ok(Flush::Done)
    }

    /// Finish the exchange after a flushed response, getting ready for the next request.
    pub fn finish_exchange(&mut self) {
        self.outgoing = None;
        self.served += 1;
        self.machine.reset();
    }
}
