//! Cross-thread wakeup for a loop blocked in the reactor.
//!
//! Linux uses an eventfd; other unixes a non-blocking pipe. Multiple
//! `notify()` calls before the loop drains coalesce into one wakeup.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) struct Notifier {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Notifier {
    pub(crate) fn new() -> io::Result<Self> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { read_fd: fd, write_fd: fd })
            } else {
                let mut fds = [0 as libc::c_int; 2];
                if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                    return Err(io::Error::last_os_error());
                }
                for fd in fds {
                    unsafe {
                        let flags = libc::fcntl(fd, libc::F_GETFL);
                        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                    }
                }
                Ok(Self { read_fd: fds[0], write_fd: fds[1] })
            }
        }
    }

    /// Descriptor the reactor watches for readability
    pub(crate) fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Wake the loop. Never blocks.
    pub(crate) fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.write_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter full or pipe full: a wakeup is already pending
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Consume pending wakeups
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        unsafe { libc::poll(&mut pfd, 1, 0) == 1 }
    }

    #[test]
    fn test_notify_and_drain() {
        let n = Notifier::new().unwrap();
        assert!(!readable(n.fd()));

        n.notify().unwrap();
        n.notify().unwrap();
        assert!(readable(n.fd()));

        n.drain();
        assert!(!readable(n.fd()));
    }
}
