use std::io;
use std::os::unix::io::RawFd;

use super::Interest;

/// Readiness reported for one registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Event {
    pub token: u64,
    /// Readable, or an error/hangup the read side should observe.
    pub readable: bool,
    pub writable: bool,
}

fn timeout_arg(timeout_ms: Option<u64>) -> i32 {
    match timeout_ms {
        None => -1,
        Some(ms) => i32::try_from(ms).unwrap_or(i32::MAX),
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::io;
    use std::os::unix::io::RawFd;

    use libc::{epoll_event, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT};

    use super::{timeout_arg, Event, Interest};

    pub struct Poller {
        epfd: RawFd,
        buf: Vec<epoll_event>,
    }

    fn mask(interest: Interest) -> u32 {
        let mut bits = 0;
        if interest.wants_in() {
            bits |= EPOLLIN as u32;
        }
        if interest.wants_out() {
            bits |= EPOLLOUT as u32;
        }
        bits
    }

    impl Poller {
        pub fn new(capacity: usize) -> io::Result<Self> {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                epfd,
                buf: vec![epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            })
        }

        fn ctl(&self, op: i32, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            let mut ev = epoll_event {
                events: mask(interest),
                u64: token,
            };
            let res = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn add(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
        }

        pub fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
        }

        pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0, Interest::NONE)
        }

        pub fn wait(&mut self, events: &mut Vec<Event>, timeout_ms: Option<u64>) -> io::Result<()> {
            events.clear();
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.buf.as_mut_ptr(),
                    self.buf.len() as i32,
                    timeout_arg(timeout_ms),
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            for raw in &self.buf[..n as usize] {
                let bits = raw.events;
                let token = raw.u64;
                let failed = bits & (EPOLLERR | EPOLLHUP) as u32 != 0;
                events.push(Event {
                    token,
                    readable: failed || bits & EPOLLIN as u32 != 0,
                    writable: bits & EPOLLOUT as u32 != 0,
                });
            }
            Ok(())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.epfd);
            }
        }
    }

    pub(super) use Poller as PollerImpl;
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use std::io;
    use std::os::unix::io::RawFd;

    use libc::{pollfd, POLLERR, POLLHUP, POLLIN, POLLOUT};

    use super::{timeout_arg, Event, Interest};

    struct Entry {
        fd: RawFd,
        token: u64,
        interest: Interest,
    }

    /// poll(2) fallback; rebuilds its fd array on every wait.
    pub struct Poller {
        entries: Vec<Entry>,
        fds: Vec<pollfd>,
    }

    fn mask(interest: Interest) -> i16 {
        let mut bits = 0;
        if interest.wants_in() {
            bits |= POLLIN;
        }
        if interest.wants_out() {
            bits |= POLLOUT;
        }
        bits
    }

    impl Poller {
        pub fn new(capacity: usize) -> io::Result<Self> {
            Ok(Self {
                entries: Vec::with_capacity(capacity),
                fds: Vec::with_capacity(capacity),
            })
        }

        pub fn add(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            if self.entries.iter().any(|e| e.fd == fd) {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            self.entries.push(Entry {
                fd,
                token,
                interest,
            });
            Ok(())
        }

        pub fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            let entry = self
                .entries
                .iter_mut()
                .find(|e| e.fd == fd)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
            entry.token = token;
            entry.interest = interest;
            Ok(())
        }

        pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
            let before = self.entries.len();
            self.entries.retain(|e| e.fd != fd);
            if self.entries.len() == before {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            Ok(())
        }

        pub fn wait(&mut self, events: &mut Vec<Event>, timeout_ms: Option<u64>) -> io::Result<()> {
            events.clear();
            self.fds.clear();
            self.fds.extend(self.entries.iter().map(|e| pollfd {
                fd: e.fd,
                events: mask(e.interest),
                revents: 0,
            }));
            let n = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout_arg(timeout_ms),
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            for (pfd, entry) in self.fds.iter().zip(&self.entries) {
                if pfd.revents == 0 {
                    continue;
                }
                let failed = pfd.revents & (POLLERR | POLLHUP) != 0;
                events.push(Event {
                    token: entry.token,
                    readable: failed || pfd.revents & POLLIN != 0,
                    writable: pfd.revents & POLLOUT != 0,
                });
            }
            Ok(())
        }
    }

    pub(super) use Poller as PollerImpl;
}

/// The OS readiness multiplexer: epoll on Linux, poll(2) elsewhere.
pub(crate) struct Poller {
    inner: platform::PollerImpl,
}

impl Poller {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            inner: platform::PollerImpl::new(capacity)?,
        })
    }

    pub fn add(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.inner.add(fd, token, interest)
    }

    pub fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.inner.modify(fd, token, interest)
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.inner.delete(fd)
    }

    /// Fills `events` with ready registrations. `None` waits indefinitely.
    pub fn wait(&mut self, events: &mut Vec<Event>, timeout_ms: Option<u64>) -> io::Result<()> {
        self.inner.wait(events, timeout_ms)
    }
}
