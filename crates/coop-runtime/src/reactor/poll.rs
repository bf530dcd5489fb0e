//! poll(2) backend for non-Linux unixes

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{timeout_ms, Event};

pub(crate) struct Poller {
    interest: HashMap<RawFd, (bool, bool)>,
    pollfds: Vec<libc::pollfd>,
}

impl Poller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            interest: HashMap::new(),
            pollfds: Vec::with_capacity(capacity),
        })
    }

    pub(crate) fn update(&mut self, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        if readable || writable {
            self.interest.insert(fd, (readable, writable));
        } else {
            self.interest.remove(&fd);
        }
        Ok(())
    }

    pub(crate) fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<()> {
        out.clear();
        self.pollfds.clear();
        for (&fd, &(r, w)) in &self.interest {
            let mut events = 0;
            if r {
                events |= libc::POLLIN;
            }
            if w {
                events |= libc::POLLOUT;
            }
            self.pollfds.push(libc::pollfd { fd, events, revents: 0 });
        }

        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
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

        for pfd in self.pollfds.iter().filter(|p| p.revents != 0) {
            let failed = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            out.push(Event {
                fd: pfd.fd,
                readable: failed || pfd.revents & libc::POLLIN != 0,
                writable: failed || pfd.revents & libc::POLLOUT != 0,
            });
        }
        Ok(())
    }
}
