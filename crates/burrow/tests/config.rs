use std::{fs, path::Path, time::Duration};

use anyhow::Error;
use burrow::{load, parse, ConfigError};
use burrow_http::{Method, DEFAULT_MAX_BODY_SIZE};
use tracing_test::traced_test;

const SITE: &str = r#"
[options]
idle_timeout_secs = 10
max_requests = 5
max_gateway_output = 4096

[[server]]
host = "127.0.0.1"
port = 8080

[[server.error_page]]
code = 404
path = "errors/404.html"

[[server.location]]
path = "/"
root = "www"
methods = ["get", "POST"]
index = "index.html"

[[server.location]]
path = "/old"
root = "www"
exact = true
return = { code = 301, target = "/new" }

[[server.location]]
path = "/cgi-bin"
root = "/srv/cgi"
max_body_size = 0
upload_dir = "uploads"
autoindex = true

[server.location.gateway]
py = "/usr/bin/python3"
".sh" = "sh"
"#;

#[test]
#[traced_test]
fn parses_full_site() -> Result<(), Error> {
    let config = parse(SITE, Path::new("/etc/burrow"))?;

    assert_eq!(config.options.idle_timeout, Duration::from_secs(10));
    assert_eq!(config.options.max_requests, 5);
    assert_eq!(config.options.max_gateway_output, 4096);
    assert_eq!(config.options.gateway_timeout, Duration::from_secs(30));

    let server = &config.servers[0];
    assert_eq!(server.addr(), "127.0.0.1:8080".parse()?);
    assert_eq!(
        server.error_page(404),
        Some(Path::new("/etc/burrow/errors/404.html"))
    );

    let root = &server.locations()[0];
    assert_eq!(root.root(), Path::new("/etc/burrow/www"));
    assert_eq!(root.methods(), &[Method::Get, Method::Post]);
    assert_eq!(root.index(), Some("index.html"));
    assert_eq!(root.max_body_size(), DEFAULT_MAX_BODY_SIZE);

    let old = &server.locations()[1];
    assert!(old.is_exact());
    let directive = old.return_directive().expect("return directive");
    assert_eq!(directive.code, 301);
    assert_eq!(directive.target, "/new");

    let cgi = &server.locations()[2];
    assert_eq!(cgi.root(), Path::new("/srv/cgi"));
    assert_eq!(cgi.body_limit(), None);
    assert!(cgi.autoindex());
    assert_eq!(cgi.upload_dir(), Some(Path::new("/etc/burrow/uploads")));
    assert_eq!(cgi.gateway(".py"), Some(Path::new("/usr/bin/python3")));
    assert_eq!(cgi.gateway(".sh"), Some(Path::new("sh")));

    Ok(())
}

#[test]
#[traced_test]
fn loads_relative_to_file() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("burrow.toml");
    fs::write(&path, SITE)?;

    let config = load(&path)?;

    assert_eq!(config.servers[0].locations()[0].root(), dir.path().join("www"));

    Ok(())
}

#[test]
#[traced_test]
fn missing_file_is_read_error() {
    let result = load(Path::new("/nonexistent/burrow.toml"));
    assert!(matches!(result, Err(ConfigError::Read { .. })));
}

#[test]
#[traced_test]
fn rejects_invalid_configs() {
    let cases = [
        ("", "no servers"),
        ("[[server]]\nhost = \"127.0.0.1\"\nport = 80\n", "missing root"),
        (
            "[[server]]\nhost = \"127.0.0.1\"\nport = 80\n\
             [[server.location]]\npath = \"/\"\nroot = \"www\"\n\
             [[server]]\nhost = \"127.0.0.1\"\nport = 80\n\
             [[server.location]]\npath = \"/\"\nroot = \"www\"\n",
            "duplicate address",
        ),
        (
            "[[server]]\nhost = \"127.0.0.1\"\nport = 80\n\
             [[server.location]]\npath = \"/\"\nroot = \"www\"\nmethods = [\"PUT\"]\n",
            "unknown method",
        ),
        (
            "[[server]]\nhost = \"127.0.0.1\"\nport = 80\n\
             [[server.location]]\npath = \"/\"\nroot = \"www\"\nreturn = { code = 30 }\n",
            "short return code",
        ),
        (
            "[[server]]\nhost = \"127.0.0.1\"\nport = 80\n\
             [[server.location]]\npath = \"nope\"\nroot = \"www\"\n",
            "relative location",
        ),
        (
            "[options]\nmax_requests = 0\n\
             [[server]]\nhost = \"127.0.0.1\"\nport = 80\n\
             [[server.location]]\npath = \"/\"\nroot = \"www\"\n",
            "zero option",
        ),
        (
            "[[server]]\nhost = \"127.0.0.1\"\nport = 80\nlisten = true\n",
            "unknown key",
        ),
    ];

    for (text, case) in cases {
        let result = parse(text, Path::new("."));
        assert!(result.is_err(), "{case} should be rejected");
    }
}

#[test]
#[traced_test]
fn error_variants_match_cause() {
    let result = parse("", Path::new("."));
    assert!(matches!(result, Err(ConfigError::NoServers)));

    let result = parse("[[server]]\nhost = \"127.0.0.1\"\nport = 80\n", Path::new("."));
    assert!(matches!(result, Err(ConfigError::MissingRootLocation(_))));

    let result = parse("[[server]\n", Path::new("."));
    assert!(matches!(result, Err(ConfigError::Syntax(_))));
}
