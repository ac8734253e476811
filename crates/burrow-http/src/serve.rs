use std::{
    fs::{self, File},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use html_escape::{encode_double_quoted_attribute, encode_text};
use tracing::{event, Level};

use crate::{extension, Location, Method, Request, Response, Route, ServerConfig};

/// What a resolved path turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    NotFound,
    PermissionDenied,
    Other,
}

/// How a routed request is answered.
#[derive(Debug)]
pub enum Dispatch {
    Respond(Response),
    Gateway {
        script: PathBuf,
        interpreter: PathBuf,
        extension: String,
    },
}

pub fn classify(path: &Path) -> FileType {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) => return classify_error(path, &error),
    };

    // Existing but unreadable is reported the same as a failed lookup
    let readable = if metadata.is_dir() {
        fs::read_dir(path).map(|_| ())
    } else if metadata.is_file() {
        File::open(path).map(|_| ())
    } else {
        return FileType::Other;
    };

    match readable {
        Err(error) => classify_error(path, &error),
        Ok(()) if metadata.is_dir() => FileType::Directory,
        Ok(()) => FileType::Regular,
    }
}

fn classify_error(path: &Path, error: &io::Error) -> FileType {
    match error.kind() {
        ErrorKind::NotFound => FileType::NotFound,
        ErrorKind::PermissionDenied => FileType::PermissionDenied,
        // Looking up a path below a regular file
        _ if path.ancestors().skip(1).any(Path::is_file) => FileType::NotFound,
        _ => FileType::Other,
    }
}

/// Decide how to answer a request that passed validation.
pub fn dispatch(
    request: &Request,
    route: &Route,
    location: &Location,
    server: &ServerConfig,
) -> Dispatch {
    let path = &route.full_path;

    match classify(path) {
        FileType::Directory => {
            if !route.trailing_slash {
                let target = with_query(format!("{}/", request.raw_path()), request);
                return Dispatch::Respond(Response::redirect(301, &target));
            }

            if let Some(index) = location.index() {
                let index_path = path.join(index);
                if classify(&index_path) == FileType::Regular {
                    return dispatch_file(request, index_path, location, server);
                }
            }

            if location.autoindex() {
                return Dispatch::Respond(listing(path, &request.path, server));
            }

            Dispatch::Respond(Response::error(404, server))
        }
        FileType::Regular => {
            if route.trailing_slash {
                let trimmed = request.raw_path().trim_end_matches('/');
                let target = with_query(trimmed.to_string(), request);
                return Dispatch::Respond(Response::redirect(301, &target));
            }

            dispatch_file(request, path.clone(), location, server)
        }
        FileType::NotFound => Dispatch::Respond(Response::error(404, server)),
        FileType::PermissionDenied => Dispatch::Respond(Response::error(403, server)),
        FileType::Other => Dispatch::Respond(Response::error(500, server)),
    }
}

fn dispatch_file(
    request: &Request,
    path: PathBuf,
    location: &Location,
    server: &ServerConfig,
) -> Dispatch {
    if let Some(extension) = extension(&path) {
        if let Some(interpreter) = location.gateway(&extension) {
            return Dispatch::Gateway {
                script: path,
                interpreter: interpreter.to_path_buf(),
                extension,
            };
        }
    }

    // Static files can only be read
    if request.method != Method::Get {
        let response = Response::error(405, server).with_header("Allow", Method::Get.as_str());
        return Dispatch::Respond(response);
    }

    let response = match fs::read(&path) {
        Ok(content) => Response::file(&path, content),
        Err(error) if error.kind() == ErrorKind::PermissionDenied => Response::error(403, server),
        Err(error) => {
            event!(Level::ERROR, ?error, path = ?path, "failed to read file");
            Response::error(500, server)
        }
    };

    Dispatch::Respond(response)
}

fn with_query(mut target: String, request: &Request) -> String {
    if !request.query.is_empty() {
        target.push('?');
        target.push_str(&request.query);
    }
    target
}

fn listing(dir: &Path, request_path: &str, server: &ServerConfig) -> Response {
    match render_listing(dir, request_path) {
        Ok(page) => Response::new(200).with_body("text/html", page),
        Err(error) if error.kind() == ErrorKind::PermissionDenied => Response::error(403, server),
        Err(error) => {
            event!(Level::ERROR, ?error, dir = ?dir, "failed to list directory");
            Response::error(500, server)
        }
    }
}

/// Render an HTML index of a directory's entries.
pub fn render_listing(dir: &Path, request_path: &str) -> io::Result<String> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();

        // Follow symlinks for the type, but keep listing broken ones
        let metadata = fs::metadata(entry.path()).or_else(|_| entry.metadata())?;
        let size = metadata.is_file().then(|| metadata.len());
        entries.push((name, metadata.is_dir(), size));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let title = encode_text(request_path);
    let mut page = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {title}</title></head>\n<body>\n\
         <h1>Index of {title}</h1>\n<table>\n\
         <tr><th>Name</th><th>Type</th><th>Size</th></tr>\n\
         <tr><td><a href=\"../\">../</a></td><td>directory</td><td>-</td></tr>\n"
    );

    for (name, is_dir, size) in entries {
        let name = if is_dir { format!("{}/", name) } else { name };
        let kind = match (is_dir, size) {
            (true, _) => "directory",
            (false, Some(_)) => "file",
            (false, None) => "other",
        };
        let size = size.map_or_else(|| "-".to_string(), |size| size.to_string());

        page.push_str(&format!(
            "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>\n",
            encode_double_quoted_attribute(&name),
            encode_text(&name),
            kind,
            size,
        ));
    }

    page.push_str("</table>\n</body>\n</html>\n");
    Ok(page)
}
