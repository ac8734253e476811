use std::{collections::HashMap, io::ErrorKind, time::Duration};

use anyhow::{Context as _, Error};
use mio::{event::Source, Events, Interest, Poll, Token};
use tracing::{event, Level};

/// Readiness registry, routing mio tokens to targets.
///
/// Every source registered through the registry gets a unique token, which is never re-used
/// for the lifetime of the registry.
pub struct Registry<T> {
    poll: Poll,
    events: Events,
    next_token: usize,
    targets: HashMap<Token, T>,
}

impl<T> Registry<T>
where
    T: Copy,
{
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().context("failed to create poll")?;

        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            next_token: 0,
            targets: HashMap::new(),
        })
    }

    /// Register a source for readiness events, routed to `target`.
    pub fn register<S>(
        &mut self,
        source: &mut S,
        interest: Interest,
        target: T,
    ) -> Result<Token, Error>
    where
        S: Source + ?Sized,
    {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(source, token, interest)
            .context("failed to register source")?;
        self.targets.insert(token, target);

        Ok(token)
    }

    pub fn reregister<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .reregister(source, token, interest)
            .context("failed to reregister source")?;
        Ok(())
    }

    /// Deregister a source, forgetting its target.
    ///
    /// Readiness events already collected for this token are dropped by `poll`'s consumers
    /// checking `is_registered`.
    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> Result<(), Error>
    where
        S: Source + ?Sized,
    {
        self.targets.remove(&token);
        self.poll
            .registry()
            .deregister(source)
            .context("failed to deregister source")?;
        Ok(())
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.targets.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Wait for readiness, returning the batch of ready targets.
    ///
    /// Multiple events for the same token in one batch are merged.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Ready<T>>, Error> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(error) => return Err(Error::new(error).context("failed to poll")),
        }

        let mut batch: Vec<Ready<T>> = Vec::new();
        for mio_event in self.events.iter() {
            let token = mio_event.token();

            let Some(target) = self.targets.get(&token).copied() else {
                event!(Level::TRACE, ?token, "dropping event for unknown token");
                continue;
            };

            let ready = Ready {
                token,
                target,
                readable: mio_event.is_readable() || mio_event.is_read_closed(),
                writable: mio_event.is_writable() || mio_event.is_write_closed(),
                error: mio_event.is_error(),
            };

            // Attempt to find an existing entry
            match batch.iter_mut().find(|r| r.token == token) {
                Some(existing) => {
                    existing.readable |= ready.readable;
                    existing.writable |= ready.writable;
                    existing.error |= ready.error;
                }
                None => batch.push(ready),
            }
        }

        Ok(batch)
    }
}

/// Readiness of a registered source.
#[derive(Debug, Clone, Copy)]
pub struct Ready<T> {
    pub token: Token,
    pub target: T,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}
