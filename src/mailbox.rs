use std::os::unix::io::RawFd;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::error;

use crate::command::{CommandSink, Envelope};
use crate::signaler::Signaler;
use crate::ypipe::{ypipe, YPipeReader, YPipeWriter};
use crate::{Error, Result};

struct Inbox {
    pipe: YPipeReader<Envelope>,
    // While active, envelopes are taken straight from the pipe without
    // touching the signaler.
    active: bool,
}

/// Command queue for one consumer thread.
///
/// Any number of threads send through the mutex-guarded writer. The single
/// consumer receives either by blocking in [`Mailbox::recv`] or by
/// registering [`Mailbox::fd`] with its reactor and calling
/// [`Mailbox::try_recv`] when it turns readable.
pub struct Mailbox {
    outbox: Mutex<YPipeWriter<Envelope>>,
    inbox: Mutex<Inbox>,
    signaler: Signaler,
}

impl Mailbox {
    pub fn new() -> Result<Self> {
        let (writer, reader) = ypipe();
        let mut inbox = Inbox {
            pipe: reader,
            active: false,
        };
        // Put the reader to sleep so the first send raises the signaler.
        let _ = inbox.pipe.check_read();
        Ok(Self {
            outbox: Mutex::new(writer),
            inbox: Mutex::new(inbox),
            signaler: Signaler::new()?,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.signaler.fd()
    }

    /// Waits up to `timeout` (`None` waits forever) for an envelope.
    ///
    /// Consumer side only. Returns `Ok(None)` on timeout.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Option<Envelope>> {
        let mut inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);

        if inbox.active {
            if let Some(envelope) = inbox.pipe.read() {
                return Ok(Some(envelope));
            }
            inbox.active = false;
        }

        if !self.signaler.wait(timeout)? {
            return Ok(None);
        }
        if !self.signaler.recv()? {
            return Ok(None);
        }

        inbox.active = true;
        match inbox.pipe.read() {
            Some(envelope) => Ok(Some(envelope)),
            None => Err(Error::Protocol("mailbox signalled without a command")),
        }
    }

    pub fn try_recv(&self) -> Result<Option<Envelope>> {
        self.recv(Some(Duration::ZERO))
    }
}

impl CommandSink for Mailbox {
    fn send(&self, envelope: Envelope) {
        let woke_sleeper = {
            let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
            outbox.write(envelope, false);
            !outbox.flush()
        };
        if woke_sleeper {
            if let Err(err) = self.signaler.send() {
                error!("mailbox signal failed: {err}");
            }
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("signaler", &self.signaler)
            .finish_non_exhaustive()
    }
}
