use std::{
    io::Write,
    net::TcpStream,
    time::{Duration, Instant},
};

use anyhow::{bail, Error};
use burrow_mio::{Ready, Registry};
use mio::{net::TcpListener, Interest};
use tracing_test::traced_test;

fn given_listener(registry: &mut Registry<u32>) -> Result<(TcpListener, mio::Token), Error> {
    let mut listener = TcpListener::bind("127.0.0.1:0".parse()?)?;
    let token = registry.register(&mut listener, Interest::READABLE, 7)?;
    Ok((listener, token))
}

fn when_polled_until_ready(registry: &mut Registry<u32>) -> Result<Vec<Ready<u32>>, Error> {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        let batch = registry.poll(Some(Duration::from_millis(50)))?;
        if !batch.is_empty() {
            return Ok(batch);
        }
    }

    bail!("no readiness before deadline")
}

#[test]
#[traced_test]
fn routes_readiness_to_target() -> Result<(), Error> {
    let mut registry = Registry::new()?;
    let (listener, token) = given_listener(&mut registry)?;

    let _client = TcpStream::connect(listener.local_addr()?)?;
    let batch = when_polled_until_ready(&mut registry)?;

    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].token, token);
    assert_eq!(batch[0].target, 7);
    assert!(batch[0].readable);

    Ok(())
}

#[test]
#[traced_test]
fn tokens_are_unique() -> Result<(), Error> {
    let mut registry = Registry::new()?;

    let (mut first, first_token) = given_listener(&mut registry)?;
    registry.deregister(&mut first, first_token)?;
    let (_second, second_token) = given_listener(&mut registry)?;

    assert_ne!(first_token, second_token);
    assert!(!registry.is_registered(first_token));
    assert!(registry.is_registered(second_token));
    assert_eq!(registry.len(), 1);

    Ok(())
}

#[test]
#[traced_test]
fn deregistered_source_is_silent() -> Result<(), Error> {
    let mut registry = Registry::new()?;
    let (mut listener, token) = given_listener(&mut registry)?;
    registry.deregister(&mut listener, token)?;

    let mut client = TcpStream::connect(listener.local_addr()?)?;
    client.write_all(b"ping")?;

    let batch = registry.poll(Some(Duration::from_millis(100)))?;
    assert!(batch.is_empty());
    assert!(registry.is_empty());

    Ok(())
}
