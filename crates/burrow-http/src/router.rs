use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{Location, Request, Response, ReturnDirective, ServerConfig};

/// Result of matching a request against a virtual host.
///
/// Carried alongside the request instead of being stored on the shared location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Index of the matched location in the virtual host.
    pub location: usize,
    /// Filesystem path the request resolves to.
    pub full_path: PathBuf,
    /// The request path ended in `/`.
    pub trailing_slash: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("no location matches the request path")]
    NoLocation,
    #[error("path escapes the location root")]
    Escapes,
}

impl RouteError {
    pub fn status(&self) -> u16 {
        match self {
            RouteError::NoLocation => 500,
            RouteError::Escapes => 403,
        }
    }
}

/// Match a request path and resolve it against the location's root.
pub fn route(server: &ServerConfig, path: &str) -> Result<Route, RouteError> {
    let index = match_location(server.locations(), path).ok_or(RouteError::NoLocation)?;
    let location = server.location(index).ok_or(RouteError::NoLocation)?;
    let full_path = resolve_path(location, path)?;

    Ok(Route {
        location: index,
        full_path,
        trailing_slash: path.ends_with('/'),
    })
}

/// Find the location with the longest matching prefix, falling back to `/`.
pub fn match_location(locations: &[Location], path: &str) -> Option<usize> {
    let mut best: Option<(usize, usize, bool)> = None;

    for (index, location) in locations.iter().enumerate() {
        if !matches(location, path) {
            continue;
        }

        // Longer prefixes win, an exact rule wins over a prefix rule of the same length
        let length = location.path().len();
        let better = match best {
            None => true,
            Some((_, best_length, best_exact)) => {
                length > best_length || (length == best_length && location.is_exact() && !best_exact)
            }
        };

        if better {
            best = Some((index, length, location.is_exact()));
        }
    }

    best.map(|(index, _, _)| index).or_else(|| {
        locations
            .iter()
            .position(|location| location.path() == "/")
    })
}

fn matches(location: &Location, path: &str) -> bool {
    let prefix = location.path();

    if path == prefix {
        return true;
    }
    if location.is_exact() || !path.starts_with(prefix) {
        return false;
    }

    prefix.ends_with('/') || path.as_bytes().get(prefix.len()) == Some(&b'/')
}

/// Resolve a request path to a filesystem path under the location's root.
///
/// `.` and `..` segments are resolved lexically first, then symlinks through the filesystem.
/// Either escaping the root is an error.
pub fn resolve_path(location: &Location, path: &str) -> Result<PathBuf, RouteError> {
    let relative = path.strip_prefix(location.path()).unwrap_or(path);

    let mut segments = Vec::new();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop().ok_or(RouteError::Escapes)?;
            }
            segment => segments.push(segment),
        }
    }

    let root = location.root();
    let mut full_path = root.to_path_buf();
    full_path.extend(segments);

    contain(root, full_path)
}

fn contain(root: &Path, full_path: PathBuf) -> Result<PathBuf, RouteError> {
    // A missing root has nothing to escape to, it will just not be found
    let Ok(canonical_root) = root.canonicalize() else {
        return Ok(full_path);
    };

    if let Ok(canonical) = full_path.canonicalize() {
        return if canonical.starts_with(&canonical_root) {
            Ok(canonical)
        } else {
            Err(RouteError::Escapes)
        };
    }

    // The path doesn't exist, but a symlink in an existing ancestor may still point out
    for ancestor in full_path.ancestors().skip(1) {
        if let Ok(canonical) = ancestor.canonicalize() {
            if !canonical.starts_with(&canonical_root) {
                return Err(RouteError::Escapes);
            }
            break;
        }
    }

    Ok(full_path)
}

/// A request refused by its location before any content is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Return(ReturnDirective),
    MethodNotAllowed { allow: String },
    LengthRequired,
    TooLarge { limit: u64 },
}

impl Rejection {
    pub fn status(&self) -> u16 {
        match self {
            Rejection::Return(directive) => directive.code,
            Rejection::MethodNotAllowed { .. } => 405,
            Rejection::LengthRequired => 411,
            Rejection::TooLarge { .. } => 413,
        }
    }

    pub fn into_response(self, server: &ServerConfig) -> Response {
        match self {
            Rejection::Return(directive) if directive.code > 399 => {
                Response::error(directive.code, server)
            }
            Rejection::Return(directive) => Response::redirect(directive.code, &directive.target),
            Rejection::MethodNotAllowed { allow } => {
                Response::error(405, server).with_header("Allow", allow)
            }
            Rejection::LengthRequired => Response::error(411, server),
            Rejection::TooLarge { .. } => Response::error(413, server),
        }
    }
}

/// Check a request head against its location.
///
/// A return directive is answered before the method and body checks run.
pub fn validate(request: &Request, location: &Location) -> Result<(), Rejection> {
    if let Some(directive) = location.return_directive() {
        if request.path == location.path() {
            return Err(Rejection::Return(directive.clone()));
        }
    }

    if !location.allows(request.method) {
        return Err(Rejection::MethodNotAllowed {
            allow: location.allowed_methods_string(),
        });
    }

    if request.method.implies_body() && !request.chunked && request.content_length.is_none() {
        return Err(Rejection::LengthRequired);
    }

    if let (Some(limit), Some(length)) = (location.body_limit(), request.content_length) {
        if length > limit {
            return Err(Rejection::TooLarge { limit });
        }
    }

    Ok(())
}
