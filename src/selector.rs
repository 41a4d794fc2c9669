use anyhow::bail;
use anyhow::Result;
use mio::event::Source;
use mio::Events;
use mio::Interest;
use mio::Poll;
use mio::Token;
use mio::Waker;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Most sockets one selector will track, including the wakeup handle.
pub const MAX_SOCKETS: usize = 1024;

// Token(0) is reserved for the waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Readiness gathered by one `Selector::wait` call.
///
/// A handle may appear in several lists at once (e.g. read and close in the
/// same batch); consumers look entries up by token and skip handles that
/// were unregistered earlier in the batch.
#[derive(Default)]
pub struct SocketEvents {
    pub read: Vec<Token>,
    pub write: Vec<Token>,
    pub close: Vec<Token>,
    /// The waker fired (cancellation or queued events).
    pub woken: bool,
}

impl SocketEvents {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.close.is_empty()
    }
}

/// Registers sockets for readiness masks and waits for events, with an
/// out-of-band cancellation signal on the reserved waker token.
pub struct Selector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    registered: usize,
}

impl Selector {
    pub fn new() -> Result<Selector> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Selector {
            poll,
            events: Events::with_capacity(1024),
            waker,
            registered: 0,
        })
    }

    /// Shareable handle that unblocks an ongoing `wait`.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn socket_count(&self) -> usize {
        self.registered
    }

    pub fn is_full(&self) -> bool {
        // One slot is spent on the waker.
        self.registered >= MAX_SOCKETS - 1
    }

    pub fn register(&mut self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<()> {
        if self.is_full() {
            bail!("selector is full ({} sockets)", self.registered);
        }
        self.poll.registry().register(source, token, interest)?;
        self.registered += 1;
        Ok(())
    }

    pub fn reregister(&mut self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<()> {
        self.poll.registry().reregister(source, token, interest)?;
        Ok(())
    }

    pub fn unregister(&mut self, source: &mut dyn Source) {
        if self.poll.registry().deregister(source).is_ok() {
            self.registered = self.registered.saturating_sub(1);
        }
    }

    /// Waits up to `timeout` for readiness events.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<SocketEvents> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                return Ok(SocketEvents::default());
            }
            Err(err) => return Err(err),
        }

        let mut out = SocketEvents::default();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                out.woken = true;
                continue;
            }
            if event.is_readable() || event.is_read_closed() {
                out.read.push(event.token());
            }
            if event.is_writable() {
                out.write.push(event.token());
            }
            if event.is_read_closed() || event.is_write_closed() || event.is_error() {
                out.close.push(event.token());
            }
        }
        Ok(out)
    }

    /// Unblocks an ongoing `wait` with zero socket events.
    pub fn cancel(&self) {
        let _ = self.waker.wake();
    }
}
