//! epoll backend (Linux)

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{timeout_ms, Event};

pub(crate) struct Poller {
    epfd: RawFd,
    /// Current epoll mask per registered fd
    registered: HashMap<RawFd, u32>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            registered: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    /// Set the interest for `fd`; no interest removes it
    pub(crate) fn update(&mut self, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        let mut mask = 0u32;
        if readable {
            mask |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if writable {
            mask |= libc::EPOLLOUT as u32;
        }

        let current = self.registered.get(&fd).copied();
        let op = match (current, mask) {
            (None, 0) => return Ok(()),
            (Some(_), 0) => libc::EPOLL_CTL_DEL,
            (Some(m), _) if m == mask => return Ok(()),
            (Some(_), _) => libc::EPOLL_CTL_MOD,
            (None, _) => libc::EPOLL_CTL_ADD,
        };

        let mut ev = libc::epoll_event { events: mask, u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if op == libc::EPOLL_CTL_DEL {
            self.registered.remove(&fd);
        }
        if ret < 0 {
            let err = io::Error::last_os_error();
            // fd already closed by its owner
            if op == libc::EPOLL_CTL_DEL && err.raw_os_error() == Some(libc::EBADF) {
                return Ok(());
            }
            return Err(err);
        }
        if op != libc::EPOLL_CTL_DEL {
            self.registered.insert(fd, mask);
        }
        Ok(())
    }

    pub(crate) fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<()> {
        out.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for ev in &self.events[..n as usize] {
            let bits = ev.events;
            let fd = ev.u64 as RawFd;
            let failed = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            out.push(Event {
                fd,
                readable: failed || bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
                writable: failed || bits & libc::EPOLLOUT as u32 != 0,
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
