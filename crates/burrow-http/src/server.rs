use std::{
    net::SocketAddr,
    path::Path,
    process::Child,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _, Error};
use burrow_mio::{check_io, Ready, Registry};
use mio::{net::TcpListener, Interest};
use thunderdome::{Arena, Index};
use tracing::{event, instrument, Level};

use crate::{
    dispatch, Advance, Connection, Dispatch, Flush, GatewayError, GatewayProcess, Drain,
    Location, Request, Response, Routed, ServerConfig, ServerOptions,
};

/// Longest wait while a gateway's exit status is outstanding, exits aren't readiness events.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// What a readiness token belongs to.
#[derive(Debug, Clone, Copy)]
enum Target {
    Listener(usize),
    Client(Index),
    GatewayOutput(Index),
    GatewayInput(Index),
}

struct Listener {
    listener: TcpListener,
    config: Rc<ServerConfig>,
    addr: SocketAddr,
}

/// Single-threaded reactor serving a set of virtual hosts.
///
/// Owns every listener, connection and gateway process. Nothing is shared with other threads,
/// so separate instances are fully isolated from each other.
pub struct Server {
    registry: Registry<Target>,
    options: ServerOptions,
    listeners: Vec<Listener>,

    connections: Arena<Connection>,
    gateways: Arena<GatewayProcess>,
    reaper: Vec<Child>,
    last_sweep: Instant,
}

impl Server {
    /// Bind a listener for every virtual host.
    #[instrument("server::bind", skip_all)]
    pub fn bind(configs: Vec<ServerConfig>, options: ServerOptions) -> Result<Self, Error> {
        let mut registry = Registry::new()?;
        let mut listeners = Vec::new();

        for config in configs {
            if !config.has_root_location() {
                bail!("server {} has no \"/\" location", config.addr());
            }

            let mut listener = TcpListener::bind(config.addr())
                .with_context(|| format!("failed to bind {}", config.addr()))?;
            let addr = listener.local_addr()?;

            registry.register(
                &mut listener,
                Interest::READABLE,
                Target::Listener(listeners.len()),
            )?;
            event!(Level::INFO, %addr, "listening");

            listeners.push(Listener {
                listener,
                config: Rc::new(config),
                addr,
            });
        }

        Ok(Self {
            registry,
            options,
            listeners,

            connections: Arena::new(),
            gateways: Arena::new(),
            reaper: Vec::new(),
            last_sweep: Instant::now(),
        })
    }

    /// Addresses actually bound, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|listener| listener.addr).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn gateway_count(&self) -> usize {
        self.gateways.len()
    }

    /// Children that finished serving but haven't been reaped yet.
    pub fn unreaped_count(&self) -> usize {
        self.reaper.len()
    }

    /// Serve until polling fails.
    pub fn run(&mut self) -> Result<(), Error> {
        let timeout = self.options.sweep_interval;

        loop {
            self.poll_once(Some(timeout))?;
        }
    }

    /// Wait for one batch of readiness events and handle it, sweeping if one is due.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let timeout = if self.gateways.iter().any(|(_, gateway)| gateway.output_done()) {
            Some(timeout.map_or(EXIT_POLL_INTERVAL, |timeout| timeout.min(EXIT_POLL_INTERVAL)))
        } else {
            timeout
        };

        let batch = self.registry.poll(timeout)?;

        for ready in batch {
            // Handling an earlier event in the batch may have closed this one's source
            if !self.registry.is_registered(ready.token) {
                continue;
            }

            self.on_ready(ready);
        }

        self.collect_exited();

        let now = Instant::now();
        if now.saturating_duration_since(self.last_sweep) >= self.options.sweep_interval {
            self.sweep(now);
        }

        Ok(())
    }

    /// Close idle connections, time out gateways and reap finished children.
    pub fn sweep(&mut self, now: Instant) {
        self.last_sweep = now;

        // Connections waiting on a gateway are covered by the gateway timeout
        let idle: Vec<Index> = self
            .connections
            .iter()
            .filter(|(_, connection)| {
                connection.gateway().is_none()
                    && connection.idle_for(now) >= self.options.idle_timeout
            })
            .map(|(index, _)| index)
            .collect();
        for index in idle {
            self.expire_connection(index);
        }

        let expired: Vec<Index> = self
            .gateways
            .iter()
            .filter(|(_, gateway)| {
                now.saturating_duration_since(gateway.started()) >= self.options.gateway_timeout
            })
            .map(|(index, _)| index)
            .collect();
        for index in expired {
            event!(Level::WARN, "gateway timed out");
            self.finish_gateway(index, Err(GatewayError::Timeout));
        }

        self.reaper.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                event!(Level::TRACE, ?status, "gateway reaped");
                false
            }
            Ok(None) => true,
            Err(error) => {
                event!(Level::WARN, ?error, "failed to reap gateway");
                false
            }
        });
    }

    fn on_ready(&mut self, ready: Ready<Target>) {
        match ready.target {
            Target::Listener(listener) => {
                if let Err(error) = self.on_listener_ready(listener) {
                    event!(Level::ERROR, ?error, "failed to accept connection");
                }
            }
            Target::Client(index) => {
                if let Err(error) = self.on_client_ready(index, ready) {
                    event!(Level::WARN, ?error, "connection failed");
                    self.close_connection(index);
                }
            }
            Target::GatewayOutput(index) => self.on_gateway_output(index),
            Target::GatewayInput(index) => self.on_gateway_input(index),
        }
    }

    fn on_listener_ready(&mut self, listener: usize) -> Result<(), Error> {
        let Some(entry) = self.listeners.get(listener) else {
            return Ok(());
        };
        let config = entry.config.clone();

        // Accept any pending streams
        while let Some((stream, peer)) = check_io(entry.listener.accept())? {
            let connection = Connection::new(stream, peer, config.clone(), &self.options);
            let id = connection.id();
            let index = self.connections.insert(connection);

            let Some(connection) = self.connections.get_mut(index) else {
                continue;
            };
            let registered = self.registry.register(
                connection.stream_mut(),
                Interest::READABLE,
                Target::Client(index),
            );

            match registered {
                Ok(token) => {
                    connection.set_token(token);
                    event!(Level::INFO, connection = %id, %peer, "connection accepted");
                }
                Err(error) => {
                    event!(Level::ERROR, ?error, "failed to register connection");
                    self.connections.remove(index);
                }
            }
        }

        Ok(())
    }

    fn on_client_ready(&mut self, index: Index, ready: Ready<Target>) -> Result<(), Error> {
        if ready.readable {
            self.on_client_readable(index)?;
        }

        if ready.writable {
            self.on_client_writable(index)?;
        }

        if ready.error && !ready.readable && !ready.writable {
            bail!("socket error");
        }

        Ok(())
    }

    fn on_client_readable(&mut self, index: Index) -> Result<(), Error> {
        loop {
            let Some(connection) = self.connections.get_mut(index) else {
                return Ok(());
            };

            let outcome = connection
                .receive(self.options.read_chunk, self.options.max_head_size)
                .context("failed to read from connection")?;

            // The peer won't send anything more, whatever gets answered now is the last
            if outcome.closed {
                connection.request_close();
            }

            self.advance_connection(index)?;

            let Some(connection) = self.connections.get_mut(index) else {
                return Ok(());
            };
            let busy = connection.has_pending_response() || connection.gateway().is_some();

            if outcome.closed {
                if !busy {
                    event!(Level::DEBUG, connection = %connection.id(), "peer closed connection");
                    self.close_connection(index);
                }
                return Ok(());
            }

            // Reading resumes once the exchange in flight is answered
            if !outcome.limited || busy {
                return Ok(());
            }
        }
    }

    fn on_client_writable(&mut self, index: Index) -> Result<(), Error> {
        let Some(connection) = self.connections.get_mut(index) else {
            return Ok(());
        };
        if !connection.has_pending_response() {
            return Ok(());
        }

        let flush = connection.flush().context("failed to write to connection")?;
        if flush == Flush::Partial {
            return Ok(());
        }

        if connection.should_close() {
            self.close_connection(index);
            return Ok(());
        }

        connection.finish_exchange();
        if let Some(token) = connection.token() {
            self.registry
                .reregister(connection.stream_mut(), token, Interest::READABLE)?;
        }

        // Bytes left in the socket won't raise another readiness event
        if connection.has_unread() {
            return self.on_client_readable(index);
        }

        // The next request may already be buffered
        self.advance_connection(index)
    }

    /// Move a connection's request forward, starting the exchange once it's complete.
    fn advance_connection(&mut self, index: Index) -> Result<(), Error> {
        let Some(connection) = self.connections.get_mut(index) else {
            return Ok(());
        };

        // One exchange at a time
        if connection.has_pending_response() || connection.gateway().is_some() {
            return Ok(());
        }

        match connection.advance() {
            Advance::Pending => Ok(()),
            Advance::Rejected(response) => self.respond(index, response, true),
            Advance::Ready(routed) => self.serve(index, *routed),
        }
    }

    fn serve(&mut self, index: Index, routed: Routed) -> Result<(), Error> {
        let Some(connection) = self.connections.get_mut(index) else {
            return Ok(());
        };
        let server = connection.server().clone();
        let Routed { request, route } = routed;

        // Persistence ends on request, or once enough requests were served
        if request.wants_close() || connection.served() + 1 >= self.options.max_requests {
            connection.request_close();
        }

        event!(
            Level::INFO,
            connection = %connection.id(),
            method = %request.method,
            path = %request.path,
            "serving request"
        );

        let Some(location) = server.location(route.location) else {
            return self.respond(index, Response::error(500, &server), true);
        };

        match dispatch(&request, &route, location, &server) {
            Dispatch::Respond(response) => self.respond(index, response, false),
            Dispatch::Gateway {
                script,
                interpreter,
                extension,
            } => {
                event!(Level::DEBUG, %extension, "request handed to gateway");
                self.start_gateway(index, &request, &script, &interpreter, location);
                Ok(())
            }
        }
    }

    /// Queue a response on a connection and wait for it to become writable.
    fn respond(&mut self, index: Index, response: Response, close: bool) -> Result<(), Error> {
        let Some(connection) = self.connections.get_mut(index) else {
            return Ok(());
        };

        if let Err(error) = connection.prepare(response, close) {
            event!(
                Level::ERROR,
                ?error,
                connection = %connection.id(),
                "second response prepared, closing connection"
            );
            self.close_connection(index);
            return Ok(());
        }

        if let Some(token) = connection.token() {
            self.registry.reregister(
                connection.stream_mut(),
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
        }

        Ok(())
    }

    fn expire_connection(&mut self, index: Index) {
        if let Some(connection) = self.connections.get_mut(index) {
            event!(Level::INFO, connection = %connection.id(), "connection idle, closing");

            // Best effort, the socket is closed right after either way
            if !connection.has_pending_response() {
                let server = connection.server().clone();
                if connection.prepare(Response::error(408, &server), true).is_ok() {
                    let _ = connection.flush();
                }
            }
        }

        self.close_connection(index);
    }

    fn close_connection(&mut self, index: Index) {
        let Some(mut connection) = self.connections.remove(index) else {
            return;
        };

        if let Some(token) = connection.token() {
            if let Err(error) = self.registry.deregister(connection.stream_mut(), token) {
                event!(Level::WARN, ?error, "failed to deregister connection");
            }
        }

        // Nobody is left to answer
        if let Some(gateway) = connection.gateway() {
            self.release_gateway(gateway, true);
        }

        event!(
            Level::DEBUG,
            connection = %connection.id(),
            peer = %connection.peer(),
            served = connection.served(),
            "connection closed"
        );
    }

    fn start_gateway(
        &mut self,
        index: Index,
        request: &Request,
        script: &Path,
        interpreter: &Path,
        location: &Location,
    ) {
        let process = match GatewayProcess::spawn(request, script, interpreter, location, index) {
            Ok(process) => process,
            Err(error) => {
                event!(Level::ERROR, ?error, "failed to start gateway");
                self.answer_gateway_error(index, error);
                return;
            }
        };

        let gateway = self.gateways.insert(process);
        if let Err(error) = self.register_gateway(gateway) {
            event!(Level::ERROR, ?error, "failed to register gateway");
            self.release_gateway(gateway, true);
            self.answer_gateway_error(index, GatewayError::Pipe(std::io::ErrorKind::Other.into()));
            return;
        }

        if let Some(connection) = self.connections.get_mut(index) {
            connection.set_gateway(Some(gateway));
        }
    }

    fn register_gateway(&mut self, gateway: Index) -> Result<(), Error> {
        let Some(process) = self.gateways.get_mut(gateway) else {
            return Ok(());
        };

        let token = self.registry.register(
            process.stdout_mut(),
            Interest::READABLE,
            Target::GatewayOutput(gateway),
        )?;
        process.set_stdout_token(token);

        if let Some(stdin) = process.stdin_mut() {
            let token =
                self.registry
                    .register(stdin, Interest::WRITABLE, Target::GatewayInput(gateway))?;
            process.set_stdin_token(token);
        }

        Ok(())
    }

    fn on_gateway_input(&mut self, gateway: Index) {
        let Some(process) = self.gateways.get_mut(gateway) else {
            return;
        };

        match process.on_writable() {
            Ok(false) => {}
            Ok(true) => {
                // Closing the pipe signals end of input
                if let Some((mut stdin, Some(token))) = process.take_stdin() {
                    if let Err(error) = self.registry.deregister(&mut stdin, token) {
                        event!(Level::WARN, ?error, "failed to deregister gateway input");
                    }
                }
            }
            Err(error) => self.finish_gateway(gateway, Err(error)),
        }
    }

    fn on_gateway_output(&mut self, gateway: Index) {
        let chunk = self.options.read_chunk;
        let limit = self.options.max_gateway_output;
        let Some(process) = self.gateways.get_mut(gateway) else {
            return;
        };

        match process.on_readable(chunk, limit) {
            Ok(Drain::Pending) => {}
            Ok(Drain::Finished) => {
                // The answer depends on the exit status, which may not be in yet
                self.detach_gateway(gateway);
                self.try_finish_gateway(gateway);
            }
            Ok(Drain::Failed(status)) => {
                self.finish_gateway(gateway, Err(GatewayError::Status(status)));
            }
            Err(error) => self.finish_gateway(gateway, Err(error)),
        }
    }

    /// Answer gateways whose output is complete and whose process has exited.
    fn collect_exited(&mut self) {
        let waiting: Vec<Index> = self
            .gateways
            .iter()
            .filter(|(_, gateway)| gateway.output_done())
            .map(|(index, _)| index)
            .collect();

        for gateway in waiting {
            self.try_finish_gateway(gateway);
        }
    }

    fn try_finish_gateway(&mut self, gateway: Index) {
        let result = self
            .gateways
            .get_mut(gateway)
            .and_then(|process| process.try_finish());

        if let Some(result) = result {
            self.finish_gateway(gateway, result);
        }
    }

    /// Release a gateway and answer its connection with the outcome.
    fn finish_gateway(&mut self, gateway: Index, result: Result<Response, GatewayError>) {
        // Anything but a clean end of output leaves the process with nothing to do
        let kill = result.is_err();
        let Some(index) = self.release_gateway(gateway, kill) else {
            return;
        };

        if let Some(connection) = self.connections.get_mut(index) {
            connection.set_gateway(None);
        }

        match result {
            Ok(response) => {
                if let Err(error) = self.respond(index, response, false) {
                    event!(Level::WARN, ?error, "failed to answer gateway request");
                    self.close_connection(index);
                }
            }
            Err(error) => {
                event!(Level::WARN, ?error, "gateway failed");
                self.answer_gateway_error(index, error);
            }
        }
    }

    fn answer_gateway_error(&mut self, index: Index, error: GatewayError) {
        let Some(connection) = self.connections.get(index) else {
            return;
        };
        let response = Response::error(error.status(), connection.server());

        if let Err(error) = self.respond(index, response, false) {
            event!(Level::WARN, ?error, "failed to answer gateway request");
            self.close_connection(index);
        }
    }

    /// Deregister and drop a gateway's pipes, returning its connection.
    ///
    /// The process is handed to the reaper, killed first if `kill` is set.
    fn release_gateway(&mut self, gateway: Index, kill: bool) -> Option<Index> {
        self.detach_gateway(gateway);
        let process = self.gateways.remove(gateway)?;

        let connection = process.connection();
        let pid = process.pid();
        let child = if kill {
            process.kill()
        } else {
            process.into_child()
        };

        event!(Level::DEBUG, pid, kill, "gateway released");
        self.reaper.push(child);

        Some(connection)
    }

    /// Deregister a gateway's pipes, closing its input.
    fn detach_gateway(&mut self, gateway: Index) {
        let Some(process) = self.gateways.get_mut(gateway) else {
            return;
        };

        if let Some(token) = process.take_stdout_token() {
            if let Err(error) = self.registry.deregister(process.stdout_mut(), token) {
                event!(Level::WARN, ?error, "failed to deregister gateway output");
            }
        }
        if let Some((mut stdin, Some(token))) = process.take_stdin() {
            if let Err(error) = self.registry.deregister(&mut stdin, token) {
                event!(Level::WARN, ?error, "failed to deregister gateway input");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let gateways: Vec<Index> = self.gateways.iter().map(|(index, _)| index).collect();
        for gateway in gateways {
            self.release_gateway(gateway, true);
        }

        for mut child in self.reaper.drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
