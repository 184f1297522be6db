// src/reactor.rs
use mio::{Events, Poll};
use std::{io, time::Duration};

/// Readiness collaborator: the scheduler's only blocking point.
///
/// The runtime itself registers no sources; it only parks here until the
/// next timer deadline or until any source a host program registered via
/// [`registry`](Reactor::registry) becomes ready.
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
        })
    }

    pub(crate) fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Blocks until `timeout` elapses or any registered source is ready.
    /// Returns the number of events observed.
    pub(crate) fn park(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.events.clear();
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self.events.iter().count())
    }
}
