use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    str,
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use burrow_mio::{read_bounded, write_available};
use mio::{
    unix::pipe::{Receiver, Sender},
    Token,
};
use thiserror::Error;
use thunderdome::Index;
use tracing::{event, instrument, Level};

use crate::{parser::is_token_byte, Headers, Location, Method, Request, Response};

const SERVER_SOFTWARE: &str = concat!("burrow/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to spawn interpreter")]
    Spawn(#[source] io::Error),
    #[error("failed to set up gateway pipe")]
    Pipe(#[source] io::Error),
    #[error("failed to read gateway output")]
    Read(#[source] io::Error),
    #[error("failed to write gateway input")]
    Write(#[source] io::Error),
    #[error("gateway exited with {0}")]
    Exit(ExitStatus),
    #[error("gateway output has no header separator")]
    MissingSeparator,
    #[error("malformed gateway output header")]
    MalformedOutput,
    #[error("gateway answered with status {0}")]
    Status(u16),
    #[error("failed to wait on gateway")]
    Wait(#[source] io::Error),
    #[error("gateway output exceeds {limit} bytes")]
    OutputTooLarge { limit: usize },
    #[error("gateway timed out")]
    Timeout,
}

impl GatewayError {
    /// Status code the client is answered with.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Spawn(_) | GatewayError::Pipe(_) => 500,
            GatewayError::Status(status) => *status,
            GatewayError::Timeout => 504,
            _ => 502,
        }
    }
}

/// Progress of draining a gateway's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// More output may follow.
    Pending,
    /// Output reached end-of-stream, the exit status decides the answer.
    Finished,
    /// The gateway reported an error status, the rest of its output is not needed.
    Failed(u16),
}

/// A running gateway process, serving one request for one connection.
pub struct GatewayProcess {
    child: Child,
    connection: Index,
    started: Instant,

    stdout: Receiver,
    stdout_token: Option<Token>,
    output: BytesMut,
    output_done: bool,
    status_checked: bool,

    stdin: Option<Sender>,
    stdin_token: Option<Token>,
    input: Bytes,
    written: usize,
}

/// Build the environment passed to a gateway process.
pub fn environment(request: &Request, script: &Path, location: &Location) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    env.insert("SCRIPT_FILENAME".to_string(), script.display().to_string());
    env.insert("SCRIPT_NAME".to_string(), request.path.clone());
    env.insert("REQUEST_METHOD".to_string(), request.method.to_string());
    env.insert("QUERY_STRING".to_string(), request.query.clone());

    if let Some(content_type) = request.headers.get("content-type") {
        env.insert("CONTENT_TYPE".to_string(), content_type.to_string());
    }
    if let Some(length) = request.content_length {
        env.insert("CONTENT_LENGTH".to_string(), length.to_string());
    }

    if matches!(request.method, Method::Post | Method::Delete) {
        if let Some(upload_dir) = location.upload_dir() {
            env.insert("UPLOAD_DIR".to_string(), upload_dir.display().to_string());
        }
    }

    env.insert("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string());
    env.insert("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string());
    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert("REDIRECT_STATUS".to_string(), "200".to_string());

    env
}

impl GatewayProcess {
    /// Start the interpreter on `script`, with non-blocking pipes for its input and output.
    #[instrument("gateway::spawn", skip_all, fields(script = ?script, interpreter = ?interpreter))]
    pub fn spawn(
        request: &Request,
        script: &Path,
        interpreter: &Path,
        location: &Location,
        connection: Index,
    ) -> Result<Self, GatewayError> {
        let env = environment(request, script, location);
        let has_input = !request.body.is_empty();

        let mut command = Command::new(interpreter);
        command
            .arg(script)
            .env_clear()
            .envs(&env)
            .stdin(if has_input { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(GatewayError::Spawn)?;
        event!(
            Level::DEBUG,
            pid = child.id(),
            method = %request.method,
            vars = env.len(),
            "gateway started"
        );

        let pipes = open_pipes(&mut child);
        let (stdout, stdin) = match pipes {
            Ok(pipes) => pipes,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(error);
            }
        };

        Ok(Self {
            child,
            connection,
            started: Instant::now(),

            stdout,
            stdout_token: None,
            output: BytesMut::new(),
            output_done: false,
            status_checked: false,

            stdin,
            stdin_token: None,
            input: request.body.clone(),
            written: 0,
        })
    }

    pub fn connection(&self) -> Index {
        self.connection
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn stdout_mut(&mut self) -> &mut Receiver {
        &mut self.stdout
    }

    pub fn set_stdout_token(&mut self, token: Token) {
        self.stdout_token = Some(token);
    }

    pub fn take_stdout_token(&mut self) -> Option<Token> {
        self.stdout_token.take()
    }

    pub fn stdin_mut(&mut self) -> Option<&mut Sender> {
        self.stdin.as_mut()
    }

    pub fn set_stdin_token(&mut self, token: Token) {
        self.stdin_token = Some(token);
    }

    /// Take the input pipe out, closing it once dropped.
    pub fn take_stdin(&mut self) -> Option<(Sender, Option<Token>)> {
        self.stdin.take().map(|stdin| (stdin, self.stdin_token.take()))
    }

    /// Output reached end-of-stream and the process is waited on.
    pub fn output_done(&self) -> bool {
        self.output_done
    }

    /// Drain available output, failing once more than `limit` bytes were produced.
    pub fn on_readable(&mut self, chunk: usize, limit: usize) -> Result<Drain, GatewayError> {
        // One byte past the limit is enough to know it's exceeded
        let budget = limit.saturating_add(1).saturating_sub(self.output.len());
        let outcome = read_bounded(&mut self.stdout, &mut self.output, chunk, budget)
            .map_err(GatewayError::Read)?;
        event!(Level::TRACE, bytes = outcome.bytes, "gateway output received");

        if self.output.len() > limit {
            return Err(GatewayError::OutputTooLarge { limit });
        }

        if outcome.closed {
            self.output_done = true;
            return Ok(Drain::Finished);
        }

        // Once the header block is in, an error status makes the body irrelevant
        if !self.status_checked {
            if let Some((head, _)) = split_output(&self.output) {
                self.status_checked = true;

                if let Ok((Some(status), _, _)) = parse_output_head(head) {
                    if status >= 400 {
                        return Ok(Drain::Failed(status));
                    }
                }
            }
        }

        Ok(Drain::Pending)
    }

    /// Write pending request body to the input pipe, returning if all of it is written.
    pub fn on_writable(&mut self) -> Result<bool, GatewayError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(true);
        };

        match write_available(stdin, &self.input[self.written..]) {
            Ok(written) => self.written += written,
            // The script stopped reading, whatever it produced is still its answer
            Err(error) if error.kind() == ErrorKind::BrokenPipe => self.written = self.input.len(),
            Err(error) => return Err(GatewayError::Write(error)),
        }

        Ok(self.written >= self.input.len())
    }

    /// Answer from the collected output, once the process has exited.
    ///
    /// Returns `None` while the process is still running.
    pub fn try_finish(&mut self) -> Option<Result<Response, GatewayError>> {
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) if !status.success() => Some(Err(GatewayError::Exit(status))),
            Ok(Some(_)) => Some(translate(&self.output)),
            Err(error) => Some(Err(GatewayError::Wait(error))),
        }
    }

    /// Hand back the child for reaping, leaving it running.
    pub fn into_child(self) -> Child {
        self.child
    }

    /// Kill the process if it's still running, handing back the child for reaping.
    pub fn kill(mut self) -> Child {
        if let Ok(None) = self.child.try_wait() {
            if let Err(error) = self.child.kill() {
                event!(Level::WARN, ?error, "failed to kill gateway");
            }
        }

        self.child
    }
}

fn open_pipes(child: &mut Child) -> Result<(Receiver, Option<Sender>), GatewayError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| GatewayError::Pipe(ErrorKind::BrokenPipe.into()))?;
    let stdout = Receiver::from(stdout);
    stdout.set_nonblocking(true).map_err(GatewayError::Pipe)?;

    let stdin = match child.stdin.take() {
        Some(stdin) => {
            let stdin = Sender::from(stdin);
            stdin.set_nonblocking(true).map_err(GatewayError::Pipe)?;
            Some(stdin)
        }
        None => None,
    };

    Ok((stdout, stdin))
}

/// Translate complete gateway output into a response.
///
/// The output starts with a header block, optionally led by a bare status line, and is split
/// from the body by the first blank line.
pub fn translate(output: &[u8]) -> Result<Response, GatewayError> {
    let (head, body) = split_output(output).ok_or(GatewayError::MissingSeparator)?;
    let (status, reason, headers) = parse_output_head(head)?;

    // A redirect without a status is a plain 302
    let status = status.unwrap_or(if headers.contains("location") { 302 } else { 200 });
    if status >= 400 {
        return Err(GatewayError::Status(status));
    }

    let mut response = Response::new(status);
    if let Some(reason) = reason {
        response = response.with_reason(reason);
    }
    response.headers = headers;

    let content_type = response
        .headers
        .get("content-type")
        .unwrap_or("text/html")
        .to_string();

    Ok(response.with_body(&content_type, Bytes::copy_from_slice(body)))
}

fn split_output(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(output, b"\r\n\r\n").map(|at| (at, 4));
    let lf = find(output, b"\n\n").map(|at| (at, 2));

    let (at, length) = match (crlf, lf) {
        (Some(crlf), Some(lf)) => {
            if lf.0 < crlf.0 {
                lf
            } else {
                crlf
            }
        }
        (Some(found), None) | (None, Some(found)) => found,
        (None, None) => return None,
    };

    Some((&output[..at], &output[at + length..]))
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    data.windows(needle.len()).position(|window| window == needle)
}

type OutputHead = (Option<u16>, Option<String>, Headers);

fn parse_output_head(head: &[u8]) -> Result<OutputHead, GatewayError> {
    let head = str::from_utf8(head).map_err(|_| GatewayError::MalformedOutput)?;

    let mut status = None;
    let mut reason = None;
    let mut headers = Headers::new();

    for (i, line) in head.lines().enumerate() {
        if line.is_empty() {
            continue;
        }

        // Bare status line
        if i == 0 {
            if let Some((code, text)) = parse_status(line) {
                status = Some(code);
                reason = text;
                continue;
            }
        }

        let (name, value) = line.split_once(':').ok_or(GatewayError::MalformedOutput)?;
        let name = name.trim();
        let value = value.trim();

        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(GatewayError::MalformedOutput);
        }
        if value.bytes().any(|byte| byte < 0x20 && byte != b'\t') {
            return Err(GatewayError::MalformedOutput);
        }

        if name.eq_ignore_ascii_case("status") {
            let (code, text) = parse_status(value).ok_or(GatewayError::MalformedOutput)?;
            status = Some(code);
            reason = text;
        } else if name.eq_ignore_ascii_case("content-length") {
            // Recomputed from the actual body
        } else {
            headers.append(name, value);
        }
    }

    Ok((status, reason, headers))
}

fn parse_status(value: &str) -> Option<(u16, Option<String>)> {
    let code = value.get(..3)?;
    if !code.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }

    let rest = &value[3..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }

    let code = code.parse().ok()?;
    let reason = Some(rest.trim()).filter(|reason| !reason.is_empty()).map(str::to_string);

    Some((code, reason))
}
