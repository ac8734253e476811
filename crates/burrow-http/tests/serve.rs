mod utils;

use std::fs;

use anyhow::{bail, Error};
use burrow_http::{
    classify, content_type, dispatch, parse_head, reason_phrase, render_listing, route, Dispatch,
    FileType, Location, Response, ServerConfig,
};
use tracing_test::traced_test;

use crate::utils::{given_config, given_site, INDEX};

fn when_dispatched(config: &ServerConfig, head: &str) -> Result<Dispatch, Error> {
    let request = parse_head(head.as_bytes())?;
    let route = route(config, &request.path)?;
    let location = &config.locations()[route.location];
    Ok(dispatch(&request, &route, location, config))
}

fn then_responds(dispatch: Dispatch) -> Result<Response, Error> {
    match dispatch {
        Dispatch::Respond(response) => Ok(response),
        Dispatch::Gateway { script, .. } => bail!("unexpected gateway for {:?}", script),
    }
}

#[test]
#[traced_test]
fn classifies_paths() -> Result<(), Error> {
    let site = given_site()?;

    assert_eq!(classify(&site.path().join("index.html")), FileType::Regular);
    assert_eq!(classify(&site.path().join("docs")), FileType::Directory);
    assert_eq!(classify(&site.path().join("missing")), FileType::NotFound);
    assert_eq!(classify(&site.path().join("index.html/below")), FileType::NotFound);

    Ok(())
}

#[test]
#[traced_test]
fn serves_file_with_type_and_length() -> Result<(), Error> {
    let site = given_site()?;
    let config = given_config(site.path())?;

    let response = then_responds(when_dispatched(&config, "GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")?)?;

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-type"), Some("text/html"));
    assert_eq!(response.headers.get("content-length"), Some("50"));
    assert_eq!(&response.body[..], INDEX.as_bytes());

    Ok(())
}

#[test]
#[traced_test]
fn directory_serves_index() -> Result<(), Error> {
    let site = given_site()?;
    let config = given_config(site.path())?;

    let response = then_responds(when_dispatched(&config, "GET / HTTP/1.1\r\nHost: x\r\n\r\n")?)?;

    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], INDEX.as_bytes());

    Ok(())
}

#[test]
#[traced_test]
fn slash_mismatches_redirect() -> Result<(), Error> {
    let site = given_site()?;
    let config = given_config(site.path())?;

    let response = then_responds(when_dispatched(&config, "GET /docs?x=1 HTTP/1.1\r\nHost: x\r\n\r\n")?)?;
    assert_eq!(response.status, 301);
    assert_eq!(response.headers.get("location"), Some("/docs/?x=1"));

    let response = then_responds(when_dispatched(&config, "GET /index.html/ HTTP/1.1\r\nHost: x\r\n\r\n")?)?;
    assert_eq!(response.status, 301);
    assert_eq!(response.headers.get("location"), Some("/index.html"));

    Ok(())
}

#[test]
#[traced_test]
fn directory_without_index_or_listing_is_not_found() -> Result<(), Error> {
    let site = given_site()?;
    let config = given_config(site.path())?;

    let response = then_responds(when_dispatched(&config, "GET /docs/ HTTP/1.1\r\nHost: x\r\n\r\n")?)?;
    assert_eq!(response.status, 404);

    Ok(())
}

#[test]
#[traced_test]
fn directory_listing_is_sorted_and_escaped() -> Result<(), Error> {
    let site = given_site()?;
    let listing = render_listing(&site.path().join("docs"), "/docs/")?;

    let bold = listing.find("&lt;b&gt;.txt").unwrap_or(usize::MAX);
    let nested = listing.find("nested/").unwrap_or(usize::MAX);
    let readme = listing.find("readme.txt").unwrap_or(usize::MAX);

    assert!(listing.contains("<a href=\"../\">../</a>"));
    assert!(listing.contains(">&lt;b&gt;.txt</a>"));
    assert!(bold < nested && nested < readme, "{}", listing);
    assert!(listing.contains("<td>file</td><td>8</td>"));
    assert!(listing.contains("<td>directory</td><td>-</td>"));

    Ok(())
}

#[test]
#[traced_test]
fn autoindex_serves_listing() -> Result<(), Error> {
    let site = given_site()?;
    let config = ServerConfig::new("127.0.0.1:0".parse()?)
        .with_location(Location::new("/", site.path()).with_autoindex(true));

    let response = then_responds(when_dispatched(&config, "GET /docs/ HTTP/1.1\r\nHost: x\r\n\r\n")?)?;

    assert_eq!(response.status, 200);
    assert!(String::from_utf8_lossy(&response.body).contains("readme.txt"));

    Ok(())
}

#[test]
#[traced_test]
fn static_files_only_allow_get() -> Result<(), Error> {
    let site = given_site()?;
    let config = given_config(site.path())?;

    let response = then_responds(when_dispatched(
        &config,
        "DELETE /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
    )?)?;

    assert_eq!(response.status, 405);
    assert_eq!(response.headers.get("allow"), Some("GET"));

    Ok(())
}

#[test]
#[traced_test]
fn gateway_extension_dispatches_to_interpreter() -> Result<(), Error> {
    let site = given_site()?;
    fs::write(site.path().join("docs/run.py"), "print('200\\r\\n\\r\\n')")?;
    let config = ServerConfig::new("127.0.0.1:0".parse()?).with_location(
        Location::new("/", site.path()).with_gateway("py", "/usr/bin/python3"),
    );

    let dispatch = when_dispatched(&config, "POST /docs/run.py HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")?;
    let Dispatch::Gateway { script, interpreter, extension } = dispatch else {
        bail!("expected gateway dispatch");
    };

    assert_eq!(script, site.path().canonicalize()?.join("docs/run.py"));
    assert_eq!(interpreter.to_str(), Some("/usr/bin/python3"));
    assert_eq!(extension, ".py");

    Ok(())
}

#[test]
#[traced_test]
fn custom_error_page_with_fallback() -> Result<(), Error> {
    let site = given_site()?;
    let page = site.path().join("404.html");
    fs::write(&page, "<h1>gone</h1>")?;

    let config = given_config(site.path())?
        .with_error_page(404, &page)
        .with_error_page(500, site.path().join("missing.html"));

    let response = Response::error(404, &config);
    assert_eq!(&response.body[..], b"<h1>gone</h1>");
    assert_eq!(response.headers.get("content-type"), Some("text/html"));

    let response = Response::error(500, &config);
    assert!(String::from_utf8_lossy(&response.body).contains("Error 500: Internal Server Error"));

    let response = Response::error(403, &config);
    assert!(String::from_utf8_lossy(&response.body).contains("Error 403: Forbidden"));

    Ok(())
}

#[test]
#[traced_test]
fn renders_wire_bytes() {
    let response = Response::new(201)
        .with_header("X-One", "1")
        .with_body("text/plain", "done");

    assert_eq!(
        &response.to_bytes()[..],
        b"HTTP/1.1 201 Created\r\nX-One: 1\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\ndone"
    );
}

#[test]
#[traced_test]
fn reason_phrases_and_types() {
    assert_eq!(reason_phrase(413), "Content Too Large");
    assert_eq!(reason_phrase(505), "HTTP Version Not Supported");
    assert_eq!(reason_phrase(299), "Unknown Status");

    assert_eq!(content_type("a/b.CSS".as_ref()), "text/css");
    assert_eq!(content_type("a/b.jpeg".as_ref()), "image/jpeg");
    assert_eq!(content_type("a/b".as_ref()), "application/octet-stream");
}
