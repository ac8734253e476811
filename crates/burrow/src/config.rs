use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use burrow_http::{Location, Method, ServerConfig, ServerOptions, DEFAULT_MAX_BODY_SIZE};
use serde::Deserialize;
use thiserror::Error;
use tracing::{event, instrument, Level};

/// Everything needed to start a server.
#[derive(Debug)]
pub struct LoadedConfig {
    pub servers: Vec<ServerConfig>,
    pub options: ServerOptions,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read \"{}\"", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration syntax")]
    Syntax(#[from] toml::de::Error),
    #[error("no server blocks")]
    NoServers,
    #[error("failed to resolve \"{host}:{port}\"")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("more than one server binds {0}")]
    DuplicateAddress(SocketAddr),
    #[error("server {0} has no \"/\" location")]
    MissingRootLocation(SocketAddr),
    #[error("location path \"{0}\" must start with '/'")]
    InvalidLocationPath(String),
    #[error("location \"{location}\" has unknown method \"{method}\"")]
    UnknownMethod { location: String, method: String },
    #[error("location \"{location}\" has return code {code}, expected three digits")]
    InvalidReturnCode { location: String, code: u16 },
    #[error("error page code {0} is not a three digit status")]
    InvalidErrorCode(u16),
    #[error("location \"{location}\" maps an empty gateway extension")]
    EmptyGatewayExtension { location: String },
    #[error("option \"{0}\" must be greater than zero")]
    ZeroOption(&'static str),
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    options: FileOptions,
    #[serde(default, rename = "server")]
    servers: Vec<FileServer>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct FileOptions {
    idle_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    read_chunk: Option<usize>,
    gateway_timeout_secs: Option<u64>,
    max_requests: Option<u64>,
    max_head_size: Option<usize>,
    max_gateway_output: Option<usize>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileServer {
    host: String,
    port: u16,
    #[serde(default)]
    error_page: Vec<FileErrorPage>,
    #[serde(default, rename = "location")]
    locations: Vec<FileLocation>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileErrorPage {
    code: u16,
    path: PathBuf,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileLocation {
    path: String,
    root: PathBuf,
    #[serde(default)]
    exact: bool,
    #[serde(default)]
    methods: Vec<String>,
    index: Option<String>,
    #[serde(default)]
    autoindex: bool,
    max_body_size: Option<u64>,
    upload_dir: Option<PathBuf>,
    #[serde(rename = "return")]
    return_directive: Option<FileReturn>,
    #[serde(default)]
    gateway: BTreeMap<String, PathBuf>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileReturn {
    code: u16,
    #[serde(default)]
    target: String,
}

/// Read and validate a configuration file.
///
/// Relative paths in the file are resolved against the file's directory.
#[instrument("load-config", skip_all, fields(path = %path.display()))]
pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let config = parse(&text, base)?;

    event!(Level::DEBUG, servers = config.servers.len(), "configuration loaded");
    Ok(config)
}

/// Parse and validate configuration text, resolving relative paths against `base`.
pub fn parse(text: &str, base: &Path) -> Result<LoadedConfig, ConfigError> {
    let file: FileConfig = toml::from_str(text)?;

    if file.servers.is_empty() {
        return Err(ConfigError::NoServers);
    }

    let mut seen = HashSet::new();
    let mut servers = Vec::with_capacity(file.servers.len());

    for server in file.servers {
        let config = convert_server(server, base)?;

        if !seen.insert(config.addr()) {
            return Err(ConfigError::DuplicateAddress(config.addr()));
        }
        if !config.has_root_location() {
            return Err(ConfigError::MissingRootLocation(config.addr()));
        }

        servers.push(config);
    }

    let options = convert_options(file.options)?;

    Ok(LoadedConfig { servers, options })
}

fn convert_server(server: FileServer, base: &Path) -> Result<ServerConfig, ConfigError> {
    let addr = resolve_addr(&server.host, server.port)?;
    let mut config = ServerConfig::new(addr);

    for page in server.error_page {
        if !is_three_digits(page.code) {
            return Err(ConfigError::InvalidErrorCode(page.code));
        }
        config = config.with_error_page(page.code, resolve_path(base, page.path));
    }

    for location in server.locations {
        config = config.with_location(convert_location(location, base)?);
    }

    Ok(config)
}

fn convert_location(file: FileLocation, base: &Path) -> Result<Location, ConfigError> {
    if !file.path.starts_with('/') {
        return Err(ConfigError::InvalidLocationPath(file.path));
    }

    let mut methods = Vec::with_capacity(file.methods.len());
    for method in &file.methods {
        let parsed = Method::parse(&method.to_ascii_uppercase()).ok_or_else(|| {
            ConfigError::UnknownMethod {
                location: file.path.clone(),
                method: method.clone(),
            }
        })?;
        methods.push(parsed);
    }

    let mut location = Location::new(file.path.clone(), resolve_path(base, file.root))
        .with_exact(file.exact)
        .with_methods(methods)
        .with_autoindex(file.autoindex)
        .with_max_body_size(file.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE));

    if let Some(index) = file.index {
        location = location.with_index(index);
    }
    if let Some(upload_dir) = file.upload_dir {
        location = location.with_upload_dir(resolve_path(base, upload_dir));
    }

    if let Some(directive) = file.return_directive {
        if !is_three_digits(directive.code) {
            return Err(ConfigError::InvalidReturnCode {
                location: file.path,
                code: directive.code,
            });
        }
        location = location.with_return(directive.code, directive.target);
    }

    for (extension, interpreter) in file.gateway {
        if extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::EmptyGatewayExtension {
                location: file.path,
            });
        }
        location = location.with_gateway(&extension, resolve_interpreter(base, interpreter));
    }

    Ok(location)
}

fn convert_options(file: FileOptions) -> Result<ServerOptions, ConfigError> {
    let mut options = ServerOptions::default();

    if let Some(secs) = file.idle_timeout_secs {
        options.idle_timeout = Duration::from_secs(nonzero("idle_timeout_secs", secs)?);
    }
    if let Some(secs) = file.sweep_interval_secs {
        options.sweep_interval = Duration::from_secs(nonzero("sweep_interval_secs", secs)?);
    }
    if let Some(secs) = file.gateway_timeout_secs {
        options.gateway_timeout = Duration::from_secs(nonzero("gateway_timeout_secs", secs)?);
    }
    if let Some(read_chunk) = file.read_chunk {
        options.read_chunk = nonzero("read_chunk", read_chunk as u64)? as usize;
    }
    if let Some(max_requests) = file.max_requests {
        options.max_requests = nonzero("max_requests", max_requests)?;
    }
    if let Some(max_head_size) = file.max_head_size {
        options.max_head_size = nonzero("max_head_size", max_head_size as u64)? as usize;
    }
    if let Some(max_gateway_output) = file.max_gateway_output {
        options.max_gateway_output =
            nonzero("max_gateway_output", max_gateway_output as u64)? as usize;
    }

    Ok(options)
}

fn nonzero(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroOption(name));
    }
    Ok(value)
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let resolve_error = |source| ConfigError::Resolve {
        host: host.to_string(),
        port,
        source,
    };

    (host, port)
        .to_socket_addrs()
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

fn resolve_path(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Bare interpreter names are left for `PATH` lookup.
fn resolve_interpreter(base: &Path, interpreter: PathBuf) -> PathBuf {
    if interpreter.components().count() > 1 {
        resolve_path(base, interpreter)
    } else {
        interpreter
    }
}

fn is_three_digits(code: u16) -> bool {
    (100..=999).contains(&code)
}
