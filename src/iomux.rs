use std::io;

use mio::event::Evented;
use mio::{Events, Poll, PollOpt, Ready, Token};

/// Thin wrapper over the OS readiness multiplexer. Connection sockets are
/// registered edge-triggered; the listening socket level-triggered.
pub struct IoMux {
    poll: Poll,
}

impl IoMux {
    pub fn new() -> io::Result<IoMux> {
        Ok(IoMux { poll: Poll::new()? })
    }

    /// Start watching `handle` for `interest`.
    #[inline]
    pub fn add<E: Evented>(
        &self,
        handle: &E,
        token: Token,
        interest: Ready,
        opt: PollOpt,
    ) -> io::Result<()> {
        self.poll.register(handle, token, interest, opt)
    }

    /// Replace the interest set of an already-watched `handle`.
    #[inline]
    pub fn modify<E: Evented>(
        &self,
        handle: &E,
        token: Token,
        interest: Ready,
        opt: PollOpt,
    ) -> io::Result<()> {
        self.poll.reregister(handle, token, interest, opt)
    }

    /// Stop watching `handle` entirely.
    #[inline]
    pub fn remove<E: Evented>(&self, handle: &E) -> io::Result<()> {
        self.poll.deregister(handle)
    }

    /// Block until at least one watched handle is ready. An interrupted wait
    /// is not an error; it is absorbed and the wait resumes. Any other
    /// failure is fatal to the caller.
    pub fn wait(&self, events: &mut Events) -> io::Result<()> {
        loop {
            match self.poll.poll(events, None) {
                Ok(_) => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
