//! I/O readiness reactor
//!
//! Tasks register interest in a descriptor together with their waker. When
//! the backend reports readiness the waker is taken, woken once, and the
//! direction is marked ready until the task consumes it:
//!
//! ```text
//!   task                         reactor                 backend
//!   read() -> WouldBlock
//!   register(fd, Readable, w) ──▶ regs[fd].read = w ────▶ add EPOLLIN
//!   Pending
//!                                wait(timeout) ◀──────── fd readable
//!                                regs[fd].read_ready = true
//!                                w.wake()          ────▶ drop EPOLLIN
//!   take_ready(fd, Readable) == true
//!   read() -> Ok(n)
//! ```
//!
//! Interest is one-shot per direction, so a level-triggered backend never
//! reports the same readiness twice.
//!
//! The notifier's descriptor is always watched; any thread can use it to
//! break a blocking `wait()`.

mod notifier;

#[cfg(any(not(target_os = "linux"), test))]
mod poll;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        use epoll::Poller;
    } else if #[cfg(unix)] {
        use poll::Poller;
    } else {
        compile_error!("Unsupported platform");
    }
}

pub(crate) use notifier::Notifier;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

/// Readiness direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// One readiness report from a backend
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Default)]
struct Registration {
    read: Option<Waker>,
    write: Option<Waker>,
    read_ready: bool,
    write_ready: bool,
}

impl Registration {
    fn is_idle(&self) -> bool {
        self.read.is_none() && self.write.is_none() && !self.read_ready && !self.write_ready
    }
}

pub(crate) struct Reactor {
    poller: Poller,
    regs: HashMap<RawFd, Registration>,
    notifier: Arc<Notifier>,
    events: Vec<Event>,
}

impl Reactor {
    pub(crate) fn new(notifier: Arc<Notifier>, capacity: usize) -> io::Result<Self> {
        let mut poller = Poller::new(capacity)?;
        poller.update(notifier.fd(), true, false)?;
        Ok(Self {
            poller,
            regs: HashMap::new(),
            notifier,
            events: Vec::with_capacity(capacity),
        })
    }

    /// Wake `waker` once when `fd` becomes ready for `interest`
    ///
    /// Replaces any waker previously registered for the same direction.
    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest, waker: &Waker) -> io::Result<()> {
        let reg = self.regs.entry(fd).or_default();
        let slot = match interest {
            Interest::Readable => &mut reg.read,
            Interest::Writable => &mut reg.write,
        };
        if !slot.as_ref().is_some_and(|w| w.will_wake(waker)) {
            *slot = Some(waker.clone());
        }
        let (r, w) = (reg.read.is_some(), reg.write.is_some());
        self.poller.update(fd, r, w)
    }

    /// Consume a readiness report for `fd`
    pub(crate) fn take_ready(&mut self, fd: RawFd, interest: Interest) -> bool {
        let Some(reg) = self.regs.get_mut(&fd) else {
            return false;
        };
        let flag = match interest {
            Interest::Readable => &mut reg.read_ready,
            Interest::Writable => &mut reg.write_ready,
        };
        std::mem::replace(flag, false)
    }

    /// Drop interest in one direction
    pub(crate) fn clear(&mut self, fd: RawFd, interest: Interest) {
        let Some(reg) = self.regs.get_mut(&fd) else {
            return;
        };
        match interest {
            Interest::Readable => {
                reg.read = None;
                reg.read_ready = false;
            }
            Interest::Writable => {
                reg.write = None;
                reg.write_ready = false;
            }
        }
        let (r, w, idle) = (reg.read.is_some(), reg.write.is_some(), reg.is_idle());
        if idle {
            self.regs.remove(&fd);
        }
        if let Err(e) = self.poller.update(fd, r, w) {
            tracing::debug!(fd, error = %e, "reactor interest update failed");
        }
    }

    /// Forget `fd` entirely; call before closing it
    pub(crate) fn deregister(&mut self, fd: RawFd) {
        self.regs.remove(&fd);
        if let Err(e) = self.poller.update(fd, false, false) {
            tracing::debug!(fd, error = %e, "reactor deregister failed");
        }
    }

    /// Number of wakers waiting for readiness
    pub(crate) fn waiting(&self) -> usize {
        self.regs
            .values()
            .map(|r| r.read.is_some() as usize + r.write.is_some() as usize)
            .sum()
    }

    /// Block until readiness, a notification, or `timeout`
    ///
    /// `None` waits indefinitely. Returns the number of wakers woken.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = std::mem::take(&mut self.events);
        let result = self.poller.wait(timeout, &mut events);
        let mut woken = 0;

        if result.is_ok() {
            for ev in &events {
                if ev.fd == self.notifier.fd() {
                    self.notifier.drain();
                    continue;
                }
                woken += self.dispatch(*ev);
            }
        }

        self.events = events;
        result.map(|_| woken)
    }

    fn dispatch(&mut self, ev: Event) -> usize {
        let Some(reg) = self.regs.get_mut(&ev.fd) else {
            return 0;
        };
        let mut wakers = Vec::with_capacity(2);
        if ev.readable {
            if let Some(w) = reg.read.take() {
                reg.read_ready = true;
                wakers.push(w);
            }
        }
        if ev.writable {
            if let Some(w) = reg.write.take() {
                reg.write_ready = true;
                wakers.push(w);
            }
        }
        let (r, w) = (reg.read.is_some(), reg.write.is_some());
        if let Err(e) = self.poller.update(ev.fd, r, w) {
            tracing::debug!(fd = ev.fd, error = %e, "reactor interest update failed");
        }

        let n = wakers.len();
        for w in wakers {
            w.wake();
        }
        n
    }
}

/// Poll-style millisecond timeout, rounded up so a short deadline does not
/// turn into a busy loop
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct Counter(AtomicUsize);

    impl Wake for Counter {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_timeout_ms_rounding() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(250))), 250);
    }

    #[test]
    fn test_readiness_is_one_shot() {
        let notifier = Arc::new(Notifier::new().unwrap());
        let mut reactor = Reactor::new(notifier, 16).unwrap();

        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [rd, wr] = fds;

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        reactor.register(rd, Interest::Readable, &waker).unwrap();
        assert_eq!(reactor.waiting(), 1);

        assert_eq!(reactor.wait(Some(Duration::ZERO)).unwrap(), 0);
        assert!(!reactor.take_ready(rd, Interest::Readable));

        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
        assert_eq!(reactor.wait(Some(Duration::from_millis(500))).unwrap(), 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.waiting(), 0);

        // Still readable, but nobody registered again
        assert_eq!(reactor.wait(Some(Duration::ZERO)).unwrap(), 0);
        assert!(reactor.take_ready(rd, Interest::Readable));
        assert!(!reactor.take_ready(rd, Interest::Readable));

        reactor.deregister(rd);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_notifier_breaks_wait() {
        let notifier = Arc::new(Notifier::new().unwrap());
        let mut reactor = Reactor::new(Arc::clone(&notifier), 16).unwrap();

        let remote = Arc::clone(&notifier);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.notify().unwrap();
        });
        // Returns instead of blocking forever
        assert_eq!(reactor.wait(None).unwrap(), 0);
        t.join().unwrap();
    }
}
