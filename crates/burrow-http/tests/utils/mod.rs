#![allow(dead_code)]

use std::{
    fs,
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    path::{Path, PathBuf},
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _, Error};
use burrow_http::{Location, RequestMachine, Server, ServerConfig, ServerOptions};
use tempfile::TempDir;
use uuid::Uuid;

/// Exactly 50 bytes.
pub const INDEX: &str = "<html><body>burrow integration index</body></html>";

/// Create a site root with an index page, a docs directory and an uploads directory.
pub fn given_site() -> Result<TempDir, Error> {
    let dir = tempfile::tempdir().context("failed to create site root")?;
    let root = dir.path();

    fs::write(root.join("index.html"), INDEX)?;
    fs::create_dir(root.join("docs"))?;
    fs::write(root.join("docs/readme.txt"), "read me\n")?;
    fs::write(root.join("docs/<b>.txt"), "bold\n")?;
    fs::create_dir(root.join("docs/nested"))?;
    fs::create_dir(root.join("uploads"))?;

    Ok(dir)
}

pub fn given_config(root: &Path) -> Result<ServerConfig, Error> {
    let config = ServerConfig::new("127.0.0.1:0".parse()?)
        .with_location(Location::new("/", root).with_index("index.html"));
    Ok(config)
}

pub fn given_server(config: ServerConfig) -> Result<(Server, SocketAddr), Error> {
    let server = Server::bind(vec![config], ServerOptions::default())?;
    let addr = server.local_addrs()[0];
    Ok((server, addr))
}

pub fn given_machine(config: ServerConfig) -> RequestMachine {
    RequestMachine::new(Uuid::new_v4(), Rc::new(config), 64 * 1024)
}

/// Find an interpreter for gateway tests, these are skipped without one.
pub fn given_python() -> Option<PathBuf> {
    ["/usr/bin/python3", "/usr/local/bin/python3", "/bin/python3"]
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

pub fn when_connected(addr: SocketAddr) -> Result<TcpStream, Error> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

pub fn when_sent(stream: &mut TcpStream, data: &[u8]) -> Result<(), Error> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(len) => written += len,
            Err(error) if error.kind() == ErrorKind::WouldBlock => continue,
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}

/// Drive the server until a full response arrives on the stream.
pub fn then_response(server: &mut Server, stream: &mut TcpStream) -> Result<RawResponse, Error> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut data = Vec::new();

    loop {
        server.poll_once(Some(Duration::from_millis(10)))?;
        let closed = read_into(stream, &mut data)?;

        if let Some(response) = RawResponse::parse(&data)? {
            return Ok(response);
        }
        if closed {
            bail!("connection closed before a full response, got {:?}", String::from_utf8_lossy(&data));
        }
        if Instant::now() > deadline {
            bail!("no response before deadline");
        }
    }
}

/// Drive the server until the stream is closed by it.
pub fn then_closed(server: &mut Server, stream: &mut TcpStream) -> Result<(), Error> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut data = Vec::new();

    loop {
        server.poll_once(Some(Duration::from_millis(10)))?;
        if read_into(stream, &mut data)? {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("connection not closed before deadline");
        }
    }
}

/// Read what's available, returning if the stream was closed.
fn read_into(stream: &mut TcpStream, data: &mut Vec<u8>) -> Result<bool, Error> {
    let mut buffer = [0; 4096];

    loop {
        match stream.read(&mut buffer) {
            Ok(0) => return Ok(true),
            Ok(len) => data.extend_from_slice(&buffer[..len]),
            Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(error) if error.kind() == ErrorKind::ConnectionReset => return Ok(true),
            Err(error) => return Err(error.into()),
        }
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Parse a response, `None` if it isn't complete yet.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, Error> {
        let Some(end) = data.windows(4).position(|window| window == b"\r\n\r\n") else {
            return Ok(None);
        };

        let head = std::str::from_utf8(&data[..end])?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().context("missing status line")?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().context("missing version")?;
        assert_eq!(version, "HTTP/1.1");
        let status = parts.next().context("missing status")?.parse()?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(": ").context("malformed header")?;
            headers.push((name.to_string(), value.to_string()));
        }

        let length: usize = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .map(|(_, value)| value.parse())
            .transpose()?
            .unwrap_or(0);

        let body_start = end + 4;
        if data.len() < body_start + length {
            return Ok(None);
        }

        Ok(Some(Self {
            status,
            reason,
            headers,
            body: data[body_start..body_start + length].to_vec(),
        }))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
