//! Single-threaded event loop over fd readiness and timers.
//!
//! Each turn:
//!
//! 1. fire due timers (re-scanning, so timers armed while firing that are
//!    already due fire in the same turn)
//! 2. apply registration changes staged since the last turn
//! 3. wait on the poller until the nearest timer or `max_wait`
//! 4. dispatch readiness per registration: accept, connect, write, read
//!
//! Handlers are boxed [`EventHandler`]s. During a callback the handler is
//! taken out of its registration, so it receives `&mut self` and a
//! `&mut Context` at the same time and may register, re-arm or remove
//! anything, itself included. Such changes are staged and reach the poller
//! at the start of the next turn; a removed registration stops receiving
//! callbacks immediately.

mod poller;
mod thread;
mod timers;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::{Error, Result};
use poller::{Event, Poller};

pub use thread::ReactorThread;
pub use timers::{Expired, TimerId, TimerStore};

/// Opaque address of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

/// Readiness a registration listens for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(1 << 1);
    pub const CONNECT: Self = Self(1 << 2);
    pub const ACCEPT: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub(crate) fn wants_in(self) -> bool {
        self.0 & (Self::READ.0 | Self::ACCEPT.0) != 0
    }

    pub(crate) fn wants_out(self) -> bool {
        self.0 & (Self::WRITE.0 | Self::CONNECT.0) != 0
    }
}

/// Callbacks for one registration. Every method defaults to doing nothing.
pub trait EventHandler {
    fn on_readable(&mut self, _handle: Handle, _cx: &mut Context) {}
    fn on_writable(&mut self, _handle: Handle, _cx: &mut Context) {}
    fn on_connect_ready(&mut self, _handle: Handle, _cx: &mut Context) {}
    fn on_accept_ready(&mut self, _handle: Handle, _cx: &mut Context) {}
    fn on_timer(&mut self, _id: u64, _handle: Handle, _cx: &mut Context) {}
}

/// Tuning for a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Readiness events taken from the poller per turn.
    pub event_capacity: usize,
    /// Consecutive early empty wakeups tolerated before the poller is
    /// rebuilt. 0 disables the check.
    pub spurious_wakeup_limit: u32,
    /// A wakeup with no events sooner than this after a blocking wait
    /// counts as early.
    pub spurious_wakeup_window: Duration,
    /// Upper bound for one wait. `None` blocks until the next timer.
    pub max_wait: Option<Duration>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            spurious_wakeup_limit: 10,
            spurious_wakeup_window: Duration::from_millis(1),
            max_wait: None,
        }
    }
}

impl ReactorConfig {
    /// Never blocks in the poller: every turn polls and returns.
    pub fn low_latency() -> Self {
        Self {
            event_capacity: 1024,
            spurious_wakeup_limit: 0,
            max_wait: Some(Duration::ZERO),
            ..Self::default()
        }
    }
}

struct Registration {
    fd: Option<RawFd>,
    handler: Option<Box<dyn EventHandler>>,
    // Requested by the owner.
    interest: Interest,
    // Currently installed in the poller.
    armed: Interest,
    in_poller: bool,
    cancelled: bool,
}

/// Registration and timer API, shared by reactor owners and callbacks.
pub struct Context {
    registrations: HashMap<Handle, Registration>,
    staged: Vec<Handle>,
    timers: TimerStore,
    clock: Box<dyn Clock>,
    next_handle: u64,
    stopped: bool,
}

impl Context {
    fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            registrations: HashMap::new(),
            staged: Vec::new(),
            timers: TimerStore::new(),
            clock,
            next_handle: 1,
            stopped: false,
        }
    }

    fn register(&mut self, fd: Option<RawFd>, handler: Box<dyn EventHandler>) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        self.registrations.insert(
            handle,
            Registration {
                fd,
                handler: Some(handler),
                interest: Interest::NONE,
                armed: Interest::NONE,
                in_poller: false,
                cancelled: false,
            },
        );
        self.staged.push(handle);
        handle
    }

    /// Registers `fd` with no interest set yet.
    pub fn add_fd(&mut self, fd: RawFd, handler: Box<dyn EventHandler>) -> Handle {
        let handle = self.register(Some(fd), handler);
        debug!("register fd {fd} as {handle:?}");
        handle
    }

    /// Registers a handler that only receives timers.
    pub fn add_handler(&mut self, handler: Box<dyn EventHandler>) -> Handle {
        self.register(None, handler)
    }

    /// Stops all callbacks for `handle` now; the fd leaves the poller next
    /// turn and the handler is dropped then.
    pub fn rm_fd(&mut self, handle: Handle) {
        if let Some(reg) = self.registrations.get_mut(&handle) {
            if !reg.cancelled {
                reg.cancelled = true;
                self.staged.push(handle);
                debug!("unregister {handle:?}");
            }
        }
    }

    fn update_interest(&mut self, handle: Handle, update: impl FnOnce(Interest) -> Interest) {
        let Some(reg) = self.registrations.get_mut(&handle) else {
            return;
        };
        if reg.cancelled {
            return;
        }
        let next = update(reg.interest);
        if next != reg.interest {
            reg.interest = next;
            self.staged.push(handle);
        }
    }

    pub fn set_pollin(&mut self, handle: Handle) {
        self.update_interest(handle, |i| i.with(Interest::READ));
    }

    pub fn reset_pollin(&mut self, handle: Handle) {
        self.update_interest(handle, |i| i.without(Interest::READ));
    }

    pub fn set_pollout(&mut self, handle: Handle) {
        self.update_interest(handle, |i| i.with(Interest::WRITE));
    }

    pub fn reset_pollout(&mut self, handle: Handle) {
        self.update_interest(handle, |i| i.without(Interest::WRITE));
    }

    pub fn set_pollconnect(&mut self, handle: Handle) {
        self.update_interest(handle, |i| i.with(Interest::CONNECT));
    }

    pub fn set_pollaccept(&mut self, handle: Handle) {
        self.update_interest(handle, |i| i.with(Interest::ACCEPT));
    }

    /// Arms a one-shot timer delivering `id` to `handle` after `timeout`.
    pub fn add_timer(&mut self, timeout: Duration, handle: Handle, id: u64) -> TimerId {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let expires_ms = self.clock.now_ms().saturating_add(timeout_ms);
        self.timers.insert(expires_ms, handle, id)
    }

    pub fn cancel_timer(&mut self, timer: TimerId) -> bool {
        self.timers.cancel(timer)
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Ends [`Reactor::run`] after the current turn.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Live (not removed) registrations.
    pub fn len(&self) -> usize {
        self.registrations.values().filter(|r| !r.cancelled).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_handler(&mut self, handle: Handle) -> Option<Box<dyn EventHandler>> {
        let reg = self.registrations.get_mut(&handle)?;
        if reg.cancelled {
            return None;
        }
        reg.handler.take()
    }

    fn restore_handler(&mut self, handle: Handle, handler: Box<dyn EventHandler>) {
        if let Some(reg) = self.registrations.get_mut(&handle) {
            reg.handler = Some(handler);
        }
    }

    fn armed(&self, handle: Handle) -> Option<Interest> {
        self.registrations
            .get(&handle)
            .filter(|reg| !reg.cancelled)
            .map(|reg| reg.armed)
    }
}

/// Counts empty wakeups that came back long before they were due.
#[derive(Debug)]
struct SpuriousWakeups {
    limit: u32,
    window: Duration,
    count: u32,
}

impl SpuriousWakeups {
    fn new(config: &ReactorConfig) -> Self {
        Self {
            limit: config.spurious_wakeup_limit,
            window: config.spurious_wakeup_window,
            count: 0,
        }
    }

    /// Returns `true` when the poller should be rebuilt.
    fn observe(&mut self, ready: usize, timeout_ms: Option<u64>, elapsed: Duration) -> bool {
        if self.limit == 0 {
            return false;
        }
        let blocking = timeout_ms.map_or(true, |ms| Duration::from_millis(ms) > self.window);
        if ready == 0 && blocking && elapsed < self.window {
            self.count += 1;
        } else {
            self.count = 0;
        }
        if self.count > self.limit {
            self.count = 0;
            return true;
        }
        false
    }
}

fn ceil_ms(duration: Duration) -> u64 {
    let ms = duration.as_nanos().div_ceil(1_000_000);
    u64::try_from(ms).unwrap_or(u64::MAX)
}

/// The event loop. Not `Send`: it lives and dies on one thread.
pub struct Reactor {
    config: ReactorConfig,
    poller: Poller,
    events: Vec<Event>,
    cx: Context,
    spurious: SpuriousWakeups,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock::new())
    }

    pub fn with_clock(config: ReactorConfig, clock: impl Clock) -> Result<Self> {
        Ok(Self {
            poller: Poller::new(config.event_capacity)?,
            events: Vec::with_capacity(config.event_capacity),
            cx: Context::new(Box::new(clock)),
            spurious: SpuriousWakeups::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub fn context(&mut self) -> &mut Context {
        &mut self.cx
    }

    /// Runs turns until [`Context::stop`].
    pub fn run(&mut self) -> Result<()> {
        debug!("reactor running");
        while !self.cx.stopped {
            self.turn(None)?;
        }
        debug!("reactor stopped");
        Ok(())
    }

    /// Runs one iteration, waiting at most `max_wait` (`None`: until the
    /// next timer or event).
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<()> {
        if self.cx.stopped {
            return Err(Error::ReactorStopped);
        }

        let timer_wait = self.execute_timers();
        if self.cx.stopped {
            return Ok(());
        }

        self.apply_staged();

        let cap = match (max_wait, self.config.max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
        .map(ceil_ms);
        let timeout_ms = match (timer_wait, cap) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let started = Instant::now();
        if let Err(err) = self.poller.wait(&mut self.events, timeout_ms) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            warn!("poller wait failed: {err}; rebuilding");
            self.rebuild()?;
            return Ok(());
        }
        if self
            .spurious
            .observe(self.events.len(), timeout_ms, started.elapsed())
        {
            warn!(
                "{} early wakeups without events; rebuilding poller",
                self.config.spurious_wakeup_limit + 1
            );
            self.rebuild()?;
            return Ok(());
        }

        let events = std::mem::take(&mut self.events);
        for event in &events {
            self.dispatch_event(*event);
        }
        self.events = events;
        Ok(())
    }

    /// Fires every due timer and returns the wait until the next one.
    fn execute_timers(&mut self) -> Option<u64> {
        loop {
            let now = self.cx.clock.now_ms();
            match self.cx.timers.take_due(now) {
                Some(expired) => self.dispatch(expired.owner, |handler, handle, cx| {
                    handler.on_timer(expired.id, handle, cx)
                }),
                None => return self.cx.timers.timeout(now),
            }
        }
    }

    fn apply_staged(&mut self) {
        let mut rejected = Vec::new();
        for handle in std::mem::take(&mut self.cx.staged) {
            let Some(reg) = self.cx.registrations.get_mut(&handle) else {
                continue;
            };

            if reg.cancelled {
                if let (Some(fd), true) = (reg.fd, reg.in_poller) {
                    // The owner may have closed the fd already.
                    if let Err(err) = self.poller.delete(fd) {
                        debug!("poller delete fd {fd}: {err}");
                    }
                }
                self.cx.registrations.remove(&handle);
                continue;
            }

            let Some(fd) = reg.fd else {
                continue;
            };
            let applied = if !reg.in_poller {
                self.poller.add(fd, handle.0, reg.interest)
            } else if reg.armed != reg.interest {
                self.poller.modify(fd, handle.0, reg.interest)
            } else {
                Ok(())
            };
            match applied {
                Ok(()) => {
                    reg.in_poller = true;
                    reg.armed = reg.interest;
                }
                Err(err) => {
                    warn!("poller rejected fd {fd} for {handle:?}: {err}; dropping it");
                    rejected.push(handle);
                }
            }
        }
        for handle in rejected {
            self.drop_registration(handle);
        }
    }

    /// Removes a registration the poller refused, along with its handler.
    fn drop_registration(&mut self, handle: Handle) {
        let Some(reg) = self.cx.registrations.remove(&handle) else {
            return;
        };
        if let (Some(fd), true) = (reg.fd, reg.in_poller) {
            if let Err(err) = self.poller.delete(fd) {
                debug!("poller delete fd {fd}: {err}");
            }
        }
    }

    /// Replaces the poller and re-registers every live registration.
    ///
    /// A registration whose fd the new poller refuses (closed, reused or
    /// unsupported) is dropped. Only failing to create the poller is an
    /// error.
    pub fn rebuild(&mut self) -> Result<()> {
        let mut poller = Poller::new(self.config.event_capacity).map_err(Error::PollerRebuild)?;
        self.cx.registrations.retain(|_, reg| !reg.cancelled);
        let mut rejected = Vec::new();
        for (handle, reg) in self.cx.registrations.iter_mut() {
            let Some(fd) = reg.fd else {
                continue;
            };
            match poller.add(fd, handle.0, reg.interest) {
                Ok(()) => {
                    reg.in_poller = true;
                    reg.armed = reg.interest;
                }
                Err(err) => {
                    warn!("rebuild: dropping fd {fd} for {handle:?}: {err}");
                    rejected.push(*handle);
                }
            }
        }
        for handle in rejected {
            self.cx.registrations.remove(&handle);
        }
        self.cx.staged.clear();
        self.poller = poller;
        warn!(
            "poller rebuilt with {} registrations",
            self.cx.registrations.len()
        );
        Ok(())
    }

    fn dispatch_event(&mut self, event: Event) {
        let handle = Handle(event.token);
        let Some(armed) = self.cx.armed(handle) else {
            return;
        };
        if event.readable && armed.contains(Interest::ACCEPT) {
            self.dispatch(handle, |h, handle, cx| h.on_accept_ready(handle, cx));
        }
        if event.writable && armed.contains(Interest::CONNECT) {
            self.dispatch(handle, |h, handle, cx| h.on_connect_ready(handle, cx));
        }
        if event.writable && armed.contains(Interest::WRITE) {
            self.dispatch(handle, |h, handle, cx| h.on_writable(handle, cx));
        }
        if event.readable && armed.contains(Interest::READ) {
            self.dispatch(handle, |h, handle, cx| h.on_readable(handle, cx));
        }
    }

    fn dispatch(
        &mut self,
        handle: Handle,
        call: impl FnOnce(&mut dyn EventHandler, Handle, &mut Context),
    ) {
        let Some(mut handler) = self.cx.take_handler(handle) else {
            return;
        };
        call(handler.as_mut(), handle, &mut self.cx);
        self.cx.restore_handler(handle, handler);
    }
}
