mod utils;

use std::{fs, os::unix::fs::symlink};

use anyhow::Error;
use burrow_http::{
    match_location, parse_head, resolve_path, validate, Location, Method, Rejection,
    ReturnDirective, RouteError,
};
use tracing_test::traced_test;

use crate::utils::given_site;

fn given_rules() -> Vec<Location> {
    vec![
        Location::new("/", "/srv/www"),
        Location::new("/images", "/srv/images"),
        Location::new("/images/exact", "/srv/exact").with_exact(true),
        Location::new("/static/", "/srv/static"),
    ]
}

#[test]
#[traced_test]
fn longest_prefix_wins() {
    let rules = given_rules();

    assert_eq!(match_location(&rules, "/images/exact"), Some(2));
    assert_eq!(match_location(&rules, "/images/foo"), Some(1));
    assert_eq!(match_location(&rules, "/images"), Some(1));
    assert_eq!(match_location(&rules, "/other"), Some(0));
    assert_eq!(match_location(&rules, "/"), Some(0));
}

#[test]
#[traced_test]
fn prefix_must_end_on_segment() {
    let rules = given_rules();

    assert_eq!(match_location(&rules, "/imagesfoo"), Some(0));
    assert_eq!(match_location(&rules, "/images/exact/more"), Some(1));
    assert_eq!(match_location(&rules, "/static/app.js"), Some(3));
}

#[test]
#[traced_test]
fn no_root_no_match() {
    let rules = vec![Location::new("/api", "/srv/api")];

    assert_eq!(match_location(&rules, "/other"), None);
    assert_eq!(match_location(&rules, "/api/v1"), Some(0));
}

#[test]
#[traced_test]
fn traversal_is_contained() -> Result<(), Error> {
    let site = given_site()?;
    let location = Location::new("/", site.path());

    assert_eq!(resolve_path(&location, "/../../etc/passwd"), Err(RouteError::Escapes));
    assert_eq!(resolve_path(&location, "/docs/../../etc"), Err(RouteError::Escapes));
    assert_eq!(RouteError::Escapes.status(), 403);

    // Staying inside is fine
    let resolved = resolve_path(&location, "/docs/../index.html")?;
    assert_eq!(resolved, site.path().canonicalize()?.join("index.html"));

    Ok(())
}

#[test]
#[traced_test]
fn symlink_escape_is_contained() -> Result<(), Error> {
    let site = given_site()?;
    let outside = tempfile::tempdir()?;
    fs::write(outside.path().join("secret.txt"), "secret")?;
    symlink(outside.path(), site.path().join("escape"))?;

    let location = Location::new("/", site.path());

    assert_eq!(resolve_path(&location, "/escape/secret.txt"), Err(RouteError::Escapes));
    assert_eq!(resolve_path(&location, "/escape/missing.txt"), Err(RouteError::Escapes));

    Ok(())
}

#[test]
#[traced_test]
fn location_prefix_is_replaced_by_root() -> Result<(), Error> {
    let site = given_site()?;
    let location = Location::new("/files", site.path().join("docs"));

    let resolved = resolve_path(&location, "/files/readme.txt")?;
    assert_eq!(resolved, site.path().canonicalize()?.join("docs/readme.txt"));

    // Missing paths resolve without canonicalizing
    let resolved = resolve_path(&location, "/files/missing.txt")?;
    assert_eq!(resolved, site.path().join("docs/missing.txt"));

    Ok(())
}

#[test]
#[traced_test]
fn return_directive_short_circuits() -> Result<(), Error> {
    let location = Location::new("/old", "/srv")
        .with_methods([Method::Get])
        .with_return(301, "/new");

    let request = parse_head(b"POST /old HTTP/1.1\r\nHost: x\r\n\r\n")?;
    assert_eq!(
        validate(&request, &location),
        Err(Rejection::Return(ReturnDirective {
            code: 301,
            target: "/new".to_string()
        }))
    );

    // Below the exact path the directive doesn't apply
    let request = parse_head(b"POST /old/page HTTP/1.1\r\nHost: x\r\n\r\n")?;
    assert_eq!(
        validate(&request, &location),
        Err(Rejection::MethodNotAllowed {
            allow: "GET".to_string()
        })
    );

    Ok(())
}

#[test]
#[traced_test]
fn method_and_body_checks() -> Result<(), Error> {
    let location = Location::new("/upload", "/srv")
        .with_methods([Method::Post, Method::Delete])
        .with_max_body_size(3);
    assert_eq!(location.allowed_methods_string(), "POST, DELETE");

    let request = parse_head(b"GET /upload HTTP/1.1\r\nHost: x\r\n\r\n")?;
    let rejection = validate(&request, &location).unwrap_err();
    assert_eq!(rejection.status(), 405);

    let request = parse_head(b"POST /upload HTTP/1.1\r\nHost: x\r\n\r\n")?;
    assert_eq!(validate(&request, &location), Err(Rejection::LengthRequired));

    let request = parse_head(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\n")?;
    assert_eq!(validate(&request, &location), Err(Rejection::TooLarge { limit: 3 }));

    let request = parse_head(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\n")?;
    assert_eq!(validate(&request, &location), Ok(()));

    let request = parse_head(b"DELETE /upload HTTP/1.1\r\nHost: x\r\n\r\n")?;
    assert_eq!(validate(&request, &location), Ok(()));

    Ok(())
}

#[test]
#[traced_test]
fn unlimited_body_size() -> Result<(), Error> {
    let location = Location::new("/", "/srv").with_max_body_size(0);
    let request = parse_head(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 99999999\r\n\r\n")?;

    assert_eq!(location.body_limit(), None);
    assert_eq!(validate(&request, &location), Ok(()));
    assert_eq!(Location::new("/", "/srv").allowed_methods_string(), "GET, POST, DELETE");

    Ok(())
}
