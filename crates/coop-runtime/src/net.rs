//! Non-blocking TCP for tasks
//!
//! Sockets are plain std sockets in non-blocking mode. An operation that
//! would block registers the task with the reactor and suspends; when the
//! descriptor becomes ready the operation is retried.
//!
//! ```ignore
//! let listener = TcpListener::bind("127.0.0.1:8080".parse()?, &BindOptions::default())?;
//! loop {
//!     let (stream, peer) = listener.accept().await?;
//!     coop_runtime::spawn(async move {
//!         let mut buf = [0u8; 4096];
//!         let n = stream.read(&mut buf).await?;
//!         stream.write_all(&buf[..n]).await
//!     })?;
//! }
//! ```

use std::future::Future;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use coop_core::{tls as task_tls, SchedError, SchedResult};

use crate::reactor::Interest;
use crate::scheduler::Handle;
use crate::tls;

/// Listening socket options
#[derive(Debug, Clone)]
pub struct BindOptions {
    pub backlog: i32,
    /// Allow several listeners on the same port
    pub reuse_port: bool,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            backlog: 1024,
            reuse_port: false,
        }
    }
}

/// Suspends the current task until `fd` is ready for `interest`
struct Readiness {
    fd: RawFd,
    interest: Interest,
    registered: Option<Handle>,
}

impl Future for Readiness {
    type Output = SchedResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (fd, interest) = (self.fd, self.interest);
        if task_tls::take_cancel_request() {
            self.unregister();
            return Poll::Ready(Err(SchedError::Cancelled));
        }

        let ready = self
            .registered
            .as_ref()
            .is_some_and(|h| h.with_reactor(|r| r.take_ready(fd, interest)));
        if ready {
            self.registered = None;
            return Poll::Ready(Ok(()));
        }

        let handle = match tls::current() {
            Ok(h) => h,
            Err(e) => return Poll::Ready(Err(e)),
        };
        if let Err(e) = handle.with_reactor(|r| r.register(fd, interest, cx.waker())) {
            return Poll::Ready(Err(e.into()));
        }
        self.registered = Some(handle);
        Poll::Pending
    }
}

impl Readiness {
    fn new(fd: RawFd, interest: Interest) -> Self {
        Self { fd, interest, registered: None }
    }

    fn unregister(&mut self) {
        if let Some(handle) = self.registered.take() {
            handle.with_reactor(|r| r.clear(self.fd, self.interest));
        }
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn deregister(fd: RawFd) {
    if let Some(handle) = tls::try_current() {
        handle.with_reactor(|r| r.deregister(fd));
    }
}

pub struct TcpListener {
    inner: std::net::TcpListener,
}

impl TcpListener {
    /// Create, configure, bind and listen
    pub fn bind(addr: SocketAddr, opts: &BindOptions) -> io::Result<Self> {
        let fd = bind_socket(addr, opts)?;
        // SAFETY: bind_socket returns a fresh listening socket we own
        let inner = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        Self::from_std(inner)
    }

    pub fn from_std(inner: std::net::TcpListener) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait for the next connection
    pub async fn accept(&self) -> SchedResult<(TcpStream, SocketAddr)> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => return Ok((TcpStream::from_accepted(stream, peer)?, peer)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    Readiness::new(self.inner.as_raw_fd(), Interest::Readable).await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        deregister(self.inner.as_raw_fd());
    }
}

pub struct TcpStream {
    inner: std::net::TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpStream {
    fn from_accepted(inner: std::net::TcpStream, peer: SocketAddr) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        inner.set_nodelay(true)?;
        Ok(Self { inner, peer: Some(peer) })
    }

    pub fn from_std(inner: std::net::TcpStream) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        let peer = inner.peer_addr().ok();
        Ok(Self { inner, peer })
    }

    /// Remote address captured when the stream was created
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Read without suspending; `WouldBlock` if nothing is available
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    /// Write without suspending; `WouldBlock` if the send buffer is full
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    pub async fn readable(&self) -> SchedResult<()> {
        Readiness::new(self.inner.as_raw_fd(), Interest::Readable).await
    }

    pub async fn writable(&self) -> SchedResult<()> {
        Readiness::new(self.inner.as_raw_fd(), Interest::Writable).await
    }

    /// Read some bytes; `Ok(0)` at end of stream
    pub async fn read(&self, buf: &mut [u8]) -> SchedResult<usize> {
        loop {
            match self.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.readable().await?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> SchedResult<usize> {
        loop {
            match self.try_write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.writable().await?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> SchedResult<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        deregister(self.inner.as_raw_fd());
    }
}

/// Socket setup: create, setsockopt, bind, listen
fn bind_socket(addr: SocketAddr, opts: &BindOptions) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let close_on_err = |err: io::Error| {
        unsafe {
            libc::close(fd);
        }
        err
    };

    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR).map_err(close_on_err)?;
    if opts.reuse_port {
        set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT).map_err(close_on_err)?;
    }

    let (storage, len) = sockaddr_of(&addr);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret != 0 {
        return Err(close_on_err(io::Error::last_os_error()));
    }

    if unsafe { libc::listen(fd, opts.backlog) } != 0 {
        return Err(close_on_err(io::Error::last_os_error()));
    }
    Ok(fd)
}

fn set_flag(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let opt: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &opt as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid sockaddr_storage
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_addr.s6_addr = a.ip().octets();
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::scheduler::Scheduler;
    use std::io::{Read as _, Write as _};
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_ephemeral() {
        let l = TcpListener::bind(loopback(), &BindOptions::default()).unwrap();
        assert_ne!(l.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_reuse_port_allows_second_listener() {
        let opts = BindOptions { reuse_port: true, ..Default::default() };
        let a = TcpListener::bind(loopback(), &opts).unwrap();
        let b = TcpListener::bind(a.local_addr().unwrap(), &opts);
        assert!(b.is_ok());
    }

    #[test]
    fn test_echo_roundtrip() {
        let s = Scheduler::with_config(RuntimeConfig::new()).unwrap();
        let listener = TcpListener::bind(loopback(), &BindOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut c = std::net::TcpStream::connect(addr).unwrap();
            c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            c.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            c.read_exact(&mut buf).unwrap();
            buf
        });

        let out = s.run_until(async move {
            let (stream, peer) = listener.accept().await?;
            assert_eq!(stream.peer_addr(), Some(peer));
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await?;
            stream.write_all(&buf[..n]).await?;
            Ok::<_, SchedError>(n)
        });
        assert_eq!(out, Ok(Ok(4)));
        assert_eq!(&client.join().unwrap(), b"ping");
    }
}
