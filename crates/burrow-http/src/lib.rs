//! HTTP/1.1 protocol engine for the burrow server.
//!
//! Bytes arrive on a connection, get turned into a validated `Request` by the `RequestMachine`,
//! are matched against a virtual host's `Location` rules, and are answered either by the static
//! file responder or by an external gateway process. The `Server` reactor drives all of it from a
//! single thread.

mod chunked;
mod config;
mod connection;
mod gateway;
mod headers;
mod machine;
mod mime;
mod parser;
mod request;
mod response;
mod router;
mod serve;
mod server;
mod status;

pub use self::{
    chunked::{reconstruct, ChunkError, ChunkPhase, ChunkedDecoder, Decode},
    config::{Location, ReturnDirective, ServerConfig, ServerOptions, DEFAULT_MAX_BODY_SIZE},
    connection::{Connection, Flush, PrepareError},
    gateway::{environment, translate, Drain, GatewayError, GatewayProcess},
    headers::Headers,
    machine::{Advance, Phase, RequestMachine, Routed},
    mime::{content_type, extension},
    parser::{
        parse_head, parse_request, HeadScanner, ParseError, MAX_HEADERS,
        MAX_HEADER_NAME_LENGTH, MAX_HEADER_VALUE_LENGTH, MAX_URI_LENGTH,
    },
    request::{Method, Request},
    response::Response,
    router::{match_location, resolve_path, route, validate, Rejection, Route, RouteError},
    serve::{classify, dispatch, render_listing, Dispatch, FileType},
    server::Server,
    status::reason_phrase,
};
