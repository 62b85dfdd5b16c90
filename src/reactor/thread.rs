use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, warn};

use super::{Context, EventHandler, Handle, Reactor, ReactorConfig};
use crate::signaler::Signaler;
use crate::{Error, Result};

struct StopOnSignal {
    signaler: Arc<Signaler>,
}

impl EventHandler for StopOnSignal {
    fn on_readable(&mut self, _handle: Handle, cx: &mut Context) {
        if let Err(err) = self.signaler.recv() {
            warn!("reactor stop signal: {err}");
        }
        cx.stop();
    }
}

/// A [`Reactor`] running on its own named thread.
pub struct ReactorThread {
    name: String,
    stopper: Arc<Signaler>,
    join: Option<JoinHandle<Result<()>>>,
}

impl ReactorThread {
    /// Spawns the thread, builds the reactor there and hands it to `setup`
    /// for initial registrations before running it.
    pub fn spawn<F>(name: impl Into<String>, config: ReactorConfig, setup: F) -> Result<Self>
    where
        F: FnOnce(&mut Reactor) -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let stopper = Arc::new(Signaler::new()?);
        let thread_stopper = Arc::clone(&stopper);
        let thread_name = name.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || -> Result<()> {
                let mut reactor = Reactor::new(config)?;
                let cx = reactor.context();
                let fd = thread_stopper.fd();
                let handle = cx.add_fd(
                    fd,
                    Box::new(StopOnSignal {
                        signaler: thread_stopper,
                    }),
                );
                cx.set_pollin(handle);

                setup(&mut reactor)?;
                let result = reactor.run();
                if let Err(err) = &result {
                    error!("reactor thread {thread_name} failed: {err}");
                }
                result
            })?;

        Ok(Self {
            name,
            stopper,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the loop has exited, whether by `stop` or on its own.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wakes the reactor, waits for it to exit and returns the loop's
    /// result.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        self.stopper.send()?;
        join.join().map_err(|_| Error::ThreadPanicked)?
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("reactor thread {} shut down with error: {err}", self.name);
        }
    }
}
