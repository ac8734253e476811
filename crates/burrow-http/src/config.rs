use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::Method;

/// Body size limit applied to a location unless configured otherwise.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;

/// A virtual host, bound to one listening address.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    addr: SocketAddr,
    error_pages: BTreeMap<u16, PathBuf>,
    locations: Vec<Location>,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            error_pages: BTreeMap::new(),
            locations: Vec::new(),
        }
    }

    pub fn with_error_page(mut self, code: u16, path: impl Into<PathBuf>) -> Self {
        self.error_pages.insert(code, path.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn error_page(&self, code: u16) -> Option<&Path> {
        self.error_pages.get(&code).map(PathBuf::as_path)
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn location(&self, index: usize) -> Option<&Location> {
        self.locations.get(index)
    }

    pub fn has_root_location(&self) -> bool {
        self.locations.iter().any(|location| location.path() == "/")
    }
}

/// A path-scoped set of serving rules.
#[derive(Debug, Clone)]
pub struct Location {
    path: String,
    exact: bool,
    root: PathBuf,

    methods: Vec<Method>,
    return_directive: Option<ReturnDirective>,
    max_body_size: u64,

    autoindex: bool,
    index: Option<String>,
    upload_dir: Option<PathBuf>,
    gateways: BTreeMap<String, PathBuf>,
}

impl Location {
    pub fn new(path: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            exact: false,
            root: root.into(),
            methods: Vec::new(),
            return_directive: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            autoindex: false,
            index: None,
            upload_dir: None,
            gateways: BTreeMap::new(),
        }
    }

    pub fn with_exact(mut self, exact: bool) -> Self {
        self.exact = exact;
        self
    }

    /// Restrict the allowed methods, an empty list allows all of them.
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods.clear();
        for method in methods {
            if !self.methods.contains(&method) {
                self.methods.push(method);
            }
        }
        self
    }

    pub fn with_return(mut self, code: u16, target: impl Into<String>) -> Self {
        self.return_directive = Some(ReturnDirective {
            code,
            target: target.into(),
        });
        self
    }

    /// Set the maximum body size, 0 means unlimited.
    pub fn with_max_body_size(mut self, max_body_size: u64) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn with_autoindex(mut self, autoindex: bool) -> Self {
        self.autoindex = autoindex;
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn with_upload_dir(mut self, upload_dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = Some(upload_dir.into());
        self
    }

    /// Map a file extension to the interpreter that runs it.
    ///
    /// The extension may be given with or without its leading dot.
    pub fn with_gateway(mut self, extension: &str, interpreter: impl Into<PathBuf>) -> Self {
        let extension = if extension.starts_with('.') {
            extension.to_string()
        } else {
            format!(".{}", extension)
        };
        self.gateways.insert(extension, interpreter.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn allows(&self, method: Method) -> bool {
        self.methods.is_empty() || self.methods.contains(&method)
    }

    /// Value for the `Allow` header.
    pub fn allowed_methods_string(&self) -> String {
        let methods: &[Method] = if self.methods.is_empty() {
            &Method::ALL
        } else {
            &self.methods
        };

        methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn return_directive(&self) -> Option<&ReturnDirective> {
        self.return_directive.as_ref()
    }

    pub fn max_body_size(&self) -> u64 {
        self.max_body_size
    }

    /// Body limit, `None` if unlimited.
    pub fn body_limit(&self) -> Option<u64> {
        (self.max_body_size != 0).then_some(self.max_body_size)
    }

    pub fn autoindex(&self) -> bool {
        self.autoindex
    }

    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    pub fn upload_dir(&self) -> Option<&Path> {
        self.upload_dir.as_deref()
    }

    pub fn gateway(&self, extension: &str) -> Option<&Path> {
        self.gateways.get(extension).map(PathBuf::as_path)
    }
}

/// A configured `return` rule, answering a location directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnDirective {
    pub code: u16,
    pub target: String,
}

/// Runtime tunables of the reactor.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Inactivity after which a connection is answered with 408 and closed.
    pub idle_timeout: Duration,
    /// Interval between idle/gateway/reaper sweeps.
    pub sweep_interval: Duration,
    /// Size of each read from a socket or pipe.
    pub read_chunk: usize,
    /// Maximum running time of a gateway process.
    pub gateway_timeout: Duration,
    /// Requests served on one persistent connection before it is closed.
    pub max_requests: u64,
    /// Maximum size of a request head, including the blank line.
    pub max_head_size: usize,
    /// Maximum output a gateway may produce before it's answered with 502.
    pub max_gateway_output: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            read_chunk: 4096 * 3,
            gateway_timeout: Duration::from_secs(30),
            max_requests: 100,
            max_head_size: 64 * 1024,
            max_gateway_output: 8 * 1024 * 1024,
        }
    }
}
