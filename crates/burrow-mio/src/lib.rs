//! Readiness plumbing for a single-threaded mio reactor.
//!
//! The `Registry` owns the `mio::Poll` and remembers, for every registered source, a
//! caller-chosen target value. The reactor uses that value to route a readiness event back to
//! whatever owns the source, without any global state.

mod io;
mod registry;

pub use self::{
    io::{check_io, read_available, read_bounded, write_available, ReadOutcome},
    registry::{Ready, Registry},
};
