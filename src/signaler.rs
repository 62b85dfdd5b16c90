use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::{Error, Result};

#[cfg(target_os = "linux")]
mod platform {
    use std::mem;
    use std::os::unix::io::RawFd;

    use libc::{read, write};

    use super::{Error, Result};

    pub struct Signaler {
        fd: RawFd,
    }

    impl Signaler {
        pub fn new() -> Result<Self> {
            let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(Self { fd })
        }

        pub fn fd(&self) -> RawFd {
            self.fd
        }

        pub fn send(&self) -> Result<()> {
            let value: u64 = 1;
            loop {
                let res = unsafe {
                    write(self.fd, &value as *const u64 as *const _, mem::size_of::<u64>())
                };
                if res >= 0 {
                    return Ok(());
                }
                let err = std::io::Error::last_os_error();
                match err.kind() {
                    std::io::ErrorKind::Interrupted => continue,
                    // Counter saturated: the reader is already signalled.
                    std::io::ErrorKind::WouldBlock => return Ok(()),
                    _ => return Err(Error::Io(err)),
                }
            }
        }

        /// Consumes every pending signal. Returns `false` if none was pending.
        pub fn recv(&self) -> Result<bool> {
            let mut buf: u64 = 0;
            loop {
                let n = unsafe {
                    read(self.fd, &mut buf as *mut u64 as *mut _, mem::size_of::<u64>())
                };
                if n >= 0 {
                    return Ok(buf > 0);
                }
                let err = std::io::Error::last_os_error();
                match err.kind() {
                    std::io::ErrorKind::Interrupted => continue,
                    std::io::ErrorKind::WouldBlock => return Ok(false),
                    _ => return Err(Error::Io(err)),
                }
            }
        }
    }

    impl Drop for Signaler {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    pub(super) use Signaler as SignalerImpl;
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use std::os::unix::io::RawFd;

    use libc::{read, write};

    use super::{Error, Result};

    /// Self-pipe: one byte per signal, drained on receive.
    pub struct Signaler {
        rfd: RawFd,
        wfd: RawFd,
    }

    fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    impl Signaler {
        pub fn new() -> Result<Self> {
            let mut fds = [0 as RawFd; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let signaler = Self {
                rfd: fds[0],
                wfd: fds[1],
            };
            set_nonblocking_cloexec(signaler.rfd)?;
            set_nonblocking_cloexec(signaler.wfd)?;
            Ok(signaler)
        }

        pub fn fd(&self) -> RawFd {
            self.rfd
        }

        pub fn send(&self) -> Result<()> {
            let byte = 1u8;
            loop {
                let res = unsafe { write(self.wfd, &byte as *const u8 as *const _, 1) };
                if res >= 0 {
                    return Ok(());
                }
                let err = std::io::Error::last_os_error();
                match err.kind() {
                    std::io::ErrorKind::Interrupted => continue,
                    // Pipe full: plenty of wakeups already pending.
                    std::io::ErrorKind::WouldBlock => return Ok(()),
                    _ => return Err(Error::Io(err)),
                }
            }
        }

        pub fn recv(&self) -> Result<bool> {
            let mut buf = [0u8; 64];
            let mut got = false;
            loop {
                let n = unsafe { read(self.rfd, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n > 0 {
                    got = true;
                    continue;
                }
                if n == 0 {
                    return Ok(got);
                }
                let err = std::io::Error::last_os_error();
                match err.kind() {
                    std::io::ErrorKind::Interrupted => continue,
                    std::io::ErrorKind::WouldBlock => return Ok(got),
                    _ => return Err(Error::Io(err)),
                }
            }
        }
    }

    impl Drop for Signaler {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.rfd);
                libc::close(self.wfd);
            }
        }
    }

    pub(super) use Signaler as SignalerImpl;
}

/// Pollable wakeup flag.
///
/// Any number of threads may `send`; one consumer waits on it or registers
/// `fd()` with a reactor for readability.
pub struct Signaler {
    inner: platform::SignalerImpl,
}

impl Signaler {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: platform::SignalerImpl::new()?,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd()
    }

    pub fn send(&self) -> Result<()> {
        self.inner.send()
    }

    /// Blocks until signalled or until `timeout` passes (`None` waits
    /// forever). Does not consume the signal. Interrupted polls resume
    /// with the remaining time.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    i32::try_from(left.as_nanos().div_ceil(1_000_000)).unwrap_or(i32::MAX)
                }
            };
            let mut pfd = libc::pollfd {
                fd: self.fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let res = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if res < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            }
            return Ok(res > 0 && (pfd.revents & libc::POLLIN) != 0);
        }
    }

    /// Consumes pending signals. Returns `false` if there were none.
    pub fn recv(&self) -> Result<bool> {
        self.inner.recv()
    }
}

impl std::fmt::Debug for Signaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signaler").field("fd", &self.fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn send_then_wait_and_recv() {
        let signaler = Signaler::new().expect("signaler");
        assert!(!signaler.wait(Some(Duration::ZERO)).expect("wait"));
        signaler.send().expect("send");
        signaler.send().expect("send");
        assert!(signaler.wait(Some(Duration::ZERO)).expect("wait"));
        assert!(signaler.recv().expect("recv"));
        assert!(!signaler.recv().expect("recv"));
        assert!(!signaler.wait(Some(Duration::ZERO)).expect("wait"));
    }

    #[test]
    fn wakes_waiter_on_other_thread() {
        let signaler = Arc::new(Signaler::new().expect("signaler"));
        let remote = Arc::clone(&signaler);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.send().expect("send");
        });
        assert!(signaler.wait(Some(Duration::from_secs(5))).expect("wait"));
        handle.join().expect("join");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn interrupted_wait_keeps_waiting() {
        use std::sync::mpsc;

        extern "C" fn ignore(_: libc::c_int) {}
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = ignore as usize;
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(
                libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()),
                0
            );
        }

        let signaler = Arc::new(Signaler::new().expect("signaler"));
        let waiter = Arc::clone(&signaler);
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _ = tid_tx.send(unsafe { libc::pthread_self() });
            let woke = waiter.wait(None).expect("wait");
            let _ = done_tx.send(woke);
        });

        let tid = tid_rx.recv().unwrap();
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(10));
            unsafe { libc::pthread_kill(tid, libc::SIGUSR1) };
        }
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

        signaler.send().expect("send");
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.join().expect("join");
    }
}
