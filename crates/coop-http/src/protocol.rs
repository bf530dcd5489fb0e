//! Per-connection HTTP protocol state machine
//!
//! The server's reader task feeds received bytes into an [`HttpProtocol`];
//! the protocol parses them, runs the handler as a task of its own, and
//! writes the response through its [`Transport`]:
//!
//! ```text
//!   AwaitingHeaders ──headers──▶ ParsingBody ──complete──▶ Dispatched
//!         ▲                                                    │ handler done
//!         │ next bytes                                          ▼
//!     KeepAlive ◀────────────── keep-alive ─────────────── Responding
//!                                                               │ close
//!   any state ── 400 / 408 / 413 / write failure ──▶ Closed ◀───┘
//! ```
//!
//! One idle timer runs per connection. It measures from the last point the
//! connection became ready for a request (accept, or a kept-alive response)
//! and re-arms itself for whatever is left of the window.
//!
//! Bytes of a pipelined request that arrive while another is in flight are
//! buffered and replayed after the keep-alive reset.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use coop_runtime::{Handle, JoinHandle, TimerHandle};

use crate::error::HttpError;
use crate::handler::{ErrorHandler, HandlerError, HandlerResult, RequestHandler};
use crate::headers::Headers;
use crate::parser::{Flow, MessageHead, ParseError, ParserCallbacks, ParserLimits, RequestParser};
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

/// Set once the server starts draining; no further keep-alive
#[derive(Debug, Default)]
pub struct ServerSignal {
    stopped: Cell<bool>,
}

impl ServerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }
}

/// Live connections of one server
#[derive(Default)]
pub struct ConnectionSet {
    conns: RefCell<HashMap<u64, Rc<HttpProtocol>>>,
    next_id: Cell<u64>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conns.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.borrow().is_empty()
    }

    /// Close every connection with no request in progress
    ///
    /// Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        let snapshot: Vec<Rc<HttpProtocol>> = self.conns.borrow().values().cloned().collect();
        snapshot.iter().filter(|c| c.close_if_idle()).count()
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn insert(&self, protocol: Rc<HttpProtocol>) {
        self.conns.borrow_mut().insert(protocol.id, protocol);
    }

    fn remove(&self, id: u64) {
        self.conns.borrow_mut().remove(&id);
    }
}

impl fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSet").field("len", &self.len()).finish()
    }
}

/// Everything a connection shares with its server
pub struct ProtocolContext {
    pub handle: Handle,
    pub handler: Rc<dyn RequestHandler>,
    pub errors: Rc<ErrorHandler>,
    pub signal: Rc<ServerSignal>,
    pub connections: Rc<ConnectionSet>,
    /// Idle window; also advertised in `Keep-Alive: timeout=`
    pub request_timeout: Duration,
    /// Upper bound on the bytes of one request
    pub request_max_size: usize,
    pub limits: ParserLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHeaders,
    ParsingBody,
    Dispatched,
    Responding,
    KeepAlive,
    Closed,
}

struct Conn {
    state: ConnectionState,
    transport: Option<Rc<dyn Transport>>,
    parser: Option<RequestParser>,
    url: Vec<u8>,
    headers: Headers,
    /// Request being parsed
    request: Option<Request>,
    /// Request handed to the handler
    current: Option<Rc<Request>>,
    received: usize,
    last_activity: Instant,
    timer: Option<TimerHandle>,
    task: Option<JoinHandle<()>>,
    pending: Vec<u8>,
}

pub struct HttpProtocol {
    id: u64,
    ctx: Rc<ProtocolContext>,
    me: Weak<HttpProtocol>,
    conn: RefCell<Conn>,
}

enum Fed {
    Partial,
    TooLarge,
    Malformed(ParseError),
    Complete(usize),
}

impl HttpProtocol {
    pub fn new(ctx: Rc<ProtocolContext>) -> Rc<Self> {
        let id = ctx.connections.next_id();
        let now = ctx.handle.time();
        Rc::new_cyclic(|me| Self {
            id,
            ctx,
            me: me.clone(),
            conn: RefCell::new(Conn {
                state: ConnectionState::AwaitingHeaders,
                transport: None,
                parser: None,
                url: Vec::new(),
                headers: Headers::new(),
                request: None,
                current: None,
                received: 0,
                last_activity: now,
                timer: None,
                task: None,
                pending: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.borrow().state
    }

    /// No request is being received or handled
    pub fn is_idle(&self) -> bool {
        self.conn.borrow().parser.is_none()
    }

    pub fn connection_made(&self, transport: Rc<dyn Transport>) {
        let peer = transport.peer_addr();
        {
            let mut c = self.conn.borrow_mut();
            c.transport = Some(transport);
            c.last_activity = self.ctx.handle.time();
        }
        self.arm_timer(self.ctx.request_timeout);
        if let Some(me) = self.me.upgrade() {
            self.ctx.connections.insert(me);
        }
        tracing::debug!(conn = self.id, peer = ?peer, "connection made");
    }

    /// The peer went away or the socket failed
    pub fn connection_lost(&self) {
        let (timer, task) = {
            let mut c = self.conn.borrow_mut();
            c.state = ConnectionState::Closed;
            c.parser = None;
            c.request = None;
            c.current = None;
            c.pending.clear();
            (c.timer.take(), c.task.take())
        };
        if let Some(timer) = timer {
            self.ctx.handle.cancel_timer(timer);
        }
        if let Some(task) = task {
            task.cancel();
        }
        self.ctx.connections.remove(self.id);
        tracing::debug!(conn = self.id, "connection lost");
    }

    pub fn data_received(&self, data: &[u8]) {
        let over = {
            let mut c = self.conn.borrow_mut();
            match c.state {
                ConnectionState::Closed => return,
                ConnectionState::Dispatched | ConnectionState::Responding => {
                    // Held for the next request, so the size guard applies here too
                    c.pending.extend_from_slice(data);
                    if c.pending.len() <= self.ctx.request_max_size {
                        return;
                    }
                    true
                }
                state => {
                    if state == ConnectionState::KeepAlive {
                        c.state = ConnectionState::AwaitingHeaders;
                    }
                    c.received += data.len();
                    c.received > self.ctx.request_max_size
                }
            }
        };
        if over {
            let task = self.conn.borrow_mut().task.take();
            if let Some(task) = task {
                task.cancel();
            }
            self.write_error(HttpError::PayloadTooLarge("Payload Too Large".to_string()));
            return;
        }

        match self.feed(data) {
            Fed::Partial => {}
            Fed::TooLarge => {
                self.write_error(HttpError::PayloadTooLarge("Payload Too Large".to_string()));
            }
            Fed::Malformed(e) => {
                tracing::debug!(conn = self.id, error = %e, "malformed request");
                self.write_error(HttpError::InvalidUsage("Bad Request".to_string()));
            }
            Fed::Complete(consumed) => self.message_complete(&data[consumed..]),
        }
    }

    /// Close the connection if no request is in progress
    ///
    /// Returns true if the connection is (now) closed.
    pub fn close_if_idle(&self) -> bool {
        let idle = {
            let c = self.conn.borrow();
            c.state == ConnectionState::Closed || c.parser.is_none()
        };
        if idle {
            self.close_transport();
        }
        idle
    }

    fn feed(&self, data: &[u8]) -> Fed {
        let mut guard = self.conn.borrow_mut();
        let c = &mut *guard;
        let peer = c.transport.as_ref().and_then(|t| t.peer_addr());
        let parser = c
            .parser
            .get_or_insert_with(|| RequestParser::with_limits(self.ctx.limits));
        let mut sink = Sink {
            url: &mut c.url,
            headers: &mut c.headers,
            request: &mut c.request,
            state: &mut c.state,
            peer,
            max_size: self.ctx.request_max_size as u64,
            too_large: false,
            complete: false,
        };
        match parser.feed(data, &mut sink) {
            Err(e) => Fed::Malformed(e),
            Ok(_) if sink.too_large => Fed::TooLarge,
            Ok(consumed) if sink.complete => Fed::Complete(consumed),
            Ok(_) => Fed::Partial,
        }
    }

    fn message_complete(&self, rest: &[u8]) {
        let request = {
            let mut c = self.conn.borrow_mut();
            c.pending.extend_from_slice(rest);
            c.received = c.received.saturating_sub(rest.len());
            let Some(request) = c.request.take() else {
                drop(c);
                self.bail_out("request completed without headers");
                return;
            };
            let request = Rc::new(request);
            c.current = Some(Rc::clone(&request));
            c.state = ConnectionState::Dispatched;
            request
        };
        tracing::trace!(conn = self.id, method = %request.method(), url = request.url(), "dispatching");
        self.dispatch(request);
    }

    fn dispatch(&self, request: Rc<Request>) {
        let handle = self.ctx.handle.clone();
        let handler = Rc::clone(&self.ctx.handler);
        let me = self.me.clone();
        let task = self.ctx.handle.spawn(async move {
            // A panicking handler resolves its own task to `Panicked`; cancelling
            // this task cancels the handler task with it
            let result = handle
                .spawn(handler.handle(request))
                .await
                .unwrap_or_else(|e| Err(HandlerError::from(e)));
            if let Some(protocol) = me.upgrade() {
                protocol.handler_finished(result);
            }
        });
        self.conn.borrow_mut().task = Some(task);
    }

    fn handler_finished(&self, result: HandlerResult) {
        {
            let mut c = self.conn.borrow_mut();
            if c.state == ConnectionState::Closed {
                return;
            }
            c.task = None;
            c.state = ConnectionState::Responding;
        }
        let response = match result {
            Ok(response) => response,
            Err(HandlerError::Cancelled) => {
                tracing::debug!(conn = self.id, "handler cancelled");
                self.close_transport();
                return;
            }
            Err(err) => {
                if let HandlerError::Internal(e) = &err {
                    tracing::error!(conn = self.id, error = ?e, "handler failed");
                }
                let current = self.conn.borrow().current.clone();
                match self.ctx.errors.response(current.as_deref(), &err) {
                    Some(response) => response,
                    None => {
                        self.close_transport();
                        return;
                    }
                }
            }
        };
        self.write_response(response);
    }

    fn write_response(&self, response: Response) {
        let (version, keep_alive, transport) = {
            let c = self.conn.borrow();
            let version = c
                .current
                .as_ref()
                .map_or_else(|| "1.1".to_string(), |r| r.version().to_string());
            let keep_alive = c.parser.as_ref().is_some_and(|p| p.should_keep_alive())
                && !self.ctx.signal.is_stopped();
            (version, keep_alive, c.transport.clone())
        };
        let Some(transport) = transport else {
            return;
        };

        let bytes = response.output(&version, keep_alive, Some(self.ctx.request_timeout.as_secs()));
        if let Err(e) = transport.write(&bytes) {
            self.bail_out(&format!("Writing response failed, connection closed {}", e));
            return;
        }
        if keep_alive {
            self.keep_alive_reset();
        } else {
            self.close_transport();
        }
    }

    /// Write an error response and close
    fn write_error(&self, error: HttpError) {
        let (bytes, transport) = {
            let c = self.conn.borrow();
            if c.state == ConnectionState::Closed {
                return;
            }
            let request = c.current.as_deref().or(c.request.as_ref());
            let version = request.map_or("1.1", |r| r.version()).to_string();
            let error = HandlerError::Http(error);
            let response = self
                .ctx
                .errors
                .response(request, &error)
                .unwrap_or_else(|| self.ctx.errors.default_response(&error));
            (response.output(&version, false, None), c.transport.clone())
        };
        if let Some(transport) = transport {
            if let Err(e) = transport.write(&bytes) {
                tracing::error!(conn = self.id, error = %e, "Writing error failed, connection closed");
            }
        }
        self.close_transport();
    }

    fn bail_out(&self, message: &str) {
        tracing::error!(conn = self.id, "{}", message);
        self.close_transport();
    }

    fn keep_alive_reset(&self) {
        let pending = {
            let mut c = self.conn.borrow_mut();
            c.last_activity = self.ctx.handle.time();
            c.parser = None;
            c.request = None;
            c.current = None;
            c.url.clear();
            c.headers = Headers::new();
            c.task = None;
            c.received = 0;
            c.state = ConnectionState::KeepAlive;
            mem::take(&mut c.pending)
        };
        if !pending.is_empty() {
            self.data_received(&pending);
        }
    }

    fn close_transport(&self) {
        let (timer, transport) = {
            let mut c = self.conn.borrow_mut();
            if c.state == ConnectionState::Closed {
                return;
            }
            c.state = ConnectionState::Closed;
            c.pending = Vec::new();
            (c.timer.take(), c.transport.clone())
        };
        if let Some(timer) = timer {
            self.ctx.handle.cancel_timer(timer);
        }
        if let Some(transport) = transport {
            transport.close();
        }
        tracing::debug!(conn = self.id, "connection closed");
    }

    fn arm_timer(&self, delay: Duration) {
        let me = self.me.clone();
        let timer = self.ctx.handle.call_later(delay, move || {
            if let Some(protocol) = me.upgrade() {
                protocol.connection_timeout();
            }
        });
        self.conn.borrow_mut().timer = Some(timer);
    }

    fn connection_timeout(&self) {
        let elapsed = {
            let mut c = self.conn.borrow_mut();
            c.timer = None;
            if c.state == ConnectionState::Closed {
                return;
            }
            self.ctx.handle.time().saturating_duration_since(c.last_activity)
        };
        if elapsed < self.ctx.request_timeout {
            self.arm_timer(self.ctx.request_timeout - elapsed);
            return;
        }

        tracing::debug!(conn = self.id, elapsed_ms = elapsed.as_millis() as u64, "request timed out");
        let task = self.conn.borrow_mut().task.take();
        if let Some(task) = task {
            task.cancel();
        }
        self.write_error(HttpError::RequestTimeout("Request Timeout".to_string()));
    }
}

impl fmt::Debug for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.conn.borrow();
        f.debug_struct("HttpProtocol")
            .field("id", &self.id)
            .field("state", &c.state)
            .field("received", &c.received)
            .field("pending", &c.pending.len())
            .finish()
    }
}

/// Parser callbacks writing into the connection's fields
struct Sink<'a> {
    url: &'a mut Vec<u8>,
    headers: &'a mut Headers,
    request: &'a mut Option<Request>,
    state: &'a mut ConnectionState,
    peer: Option<SocketAddr>,
    max_size: u64,
    too_large: bool,
    complete: bool,
}

impl ParserCallbacks for Sink<'_> {
    fn on_message_begin(&mut self) -> Flow {
        self.url.clear();
        *self.headers = Headers::new();
        Flow::Continue(())
    }

    fn on_url(&mut self, url: &[u8]) -> Flow {
        self.url.extend_from_slice(url);
        Flow::Continue(())
    }

    fn on_header(&mut self, name: &[u8], value: &[u8]) -> Flow {
        if name.eq_ignore_ascii_case(b"content-length") {
            let declared = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok());
            if declared.is_some_and(|n| n > self.max_size) {
                self.too_large = true;
                return Flow::Break(());
            }
        }
        self.headers
            .append(String::from_utf8_lossy(name), String::from_utf8_lossy(value));
        Flow::Continue(())
    }

    fn on_headers_complete(&mut self, head: &MessageHead) -> Flow {
        let mut headers = mem::take(self.headers);
        if let Some(peer) = self.peer {
            headers.append("Remote-Addr", peer.to_string());
        }
        let mut request = Request::new(head.method, &self.url[..], head.version.clone(), headers);
        if let Some(peer) = self.peer {
            request = request.with_remote_addr(peer);
        }
        *self.request = Some(request);
        *self.state = ConnectionState::ParsingBody;
        Flow::Continue(())
    }

    fn on_body(&mut self, chunk: &[u8]) -> Flow {
        if let Some(request) = self.request.as_mut() {
            request.extend_body(chunk);
        }
        Flow::Continue(())
    }

    fn on_message_complete(&mut self) -> Flow {
        self.complete = true;
        Flow::Break(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::text;
    use coop_runtime::{sleep, yield_now, RuntimeConfig, Scheduler};
    use std::io;

    #[derive(Default)]
    struct MockTransport {
        written: RefCell<Vec<u8>>,
        closed: Cell<bool>,
        fail_writes: Cell<bool>,
        peer: Option<SocketAddr>,
    }

    impl MockTransport {
        fn output(&self) -> String {
            String::from_utf8_lossy(&self.written.borrow()).into_owned()
        }
    }

    impl Transport for MockTransport {
        fn write(&self, data: &[u8]) -> io::Result<()> {
            if self.fail_writes.get() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
            }
            self.written.borrow_mut().extend_from_slice(data);
            Ok(())
        }

        fn close(&self) {
            self.closed.set(true);
        }

        fn is_closing(&self) -> bool {
            self.closed.get()
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            self.peer
        }
    }

    fn context(
        handle: Handle,
        handler: impl RequestHandler + 'static,
        timeout: Duration,
        max_size: usize,
    ) -> Rc<ProtocolContext> {
        Rc::new(ProtocolContext {
            handle,
            handler: Rc::new(handler),
            errors: Rc::new(ErrorHandler::default()),
            signal: Rc::new(ServerSignal::new()),
            connections: Rc::new(ConnectionSet::new()),
            request_timeout: timeout,
            request_max_size: max_size,
            limits: ParserLimits::default(),
        })
    }

    fn open(ctx: &Rc<ProtocolContext>) -> (Rc<HttpProtocol>, Rc<MockTransport>) {
        let transport = Rc::new(MockTransport {
            peer: Some("127.0.0.1:4000".parse().unwrap()),
            ..Default::default()
        });
        let protocol = HttpProtocol::new(Rc::clone(ctx));
        protocol.connection_made(Rc::clone(&transport) as Rc<dyn Transport>);
        (protocol, transport)
    }

    async fn settle() {
        for _ in 0..8 {
            yield_now().await.unwrap();
        }
    }

    fn echo_url(req: Rc<Request>) -> impl std::future::Future<Output = HandlerResult> {
        async move { Ok(text(req.url().to_string())) }
    }

    fn with_handle<F, Fut>(f: F)
    where
        F: FnOnce(Handle) -> Fut,
        Fut: std::future::Future<Output = ()> + 'static,
    {
        let s = Scheduler::with_config(RuntimeConfig::new()).unwrap();
        s.run_until(f(s.handle())).unwrap();
    }

    #[test]
    fn test_simple_request_keeps_alive() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            assert_eq!(ctx.connections.len(), 1);

            p.data_received(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
            assert_eq!(p.state(), ConnectionState::Dispatched);
            settle().await;

            let out = t.output();
            assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(out.contains("Connection: keep-alive\r\n"));
            assert!(out.contains("Keep-Alive: timeout=60\r\n"));
            assert!(out.ends_with("\r\n\r\n/hello"));
            assert!(!t.closed.get());
            assert_eq!(p.state(), ConnectionState::KeepAlive);
            assert!(p.is_idle());
        });
    }

    #[test]
    fn test_remote_addr_header_added() {
        with_handle(|h| async move {
            let handler = |req: Rc<Request>| async move {
                let addr = req.headers().get("remote-addr").unwrap_or("none").to_string();
                assert_eq!(req.remote_addr(), Some("127.0.0.1:4000".parse().unwrap()));
                Ok::<_, HandlerError>(text(addr))
            };
            let ctx = context(h, handler, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"GET / HTTP/1.1\r\n\r\n");
            settle().await;
            assert!(t.output().ends_with("\r\n\r\n127.0.0.1:4000"));
        });
    }

    #[test]
    fn test_idle_connection_times_out() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_millis(200), 1 << 20);
            let (p, t) = open(&ctx);
            sleep(Duration::from_millis(300)).await.unwrap();

            let out = t.output();
            assert!(out.starts_with("HTTP/1.1 408 Request Timeout\r\n"), "{out}");
            assert!(out.contains("Connection: close\r\n"));
            assert!(out.ends_with("Error: Request Timeout"));
            assert!(t.closed.get());
            assert_eq!(p.state(), ConnectionState::Closed);
        });
    }

    #[test]
    fn test_active_keep_alive_never_times_out() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_millis(300), 1 << 20);
            let (p, t) = open(&ctx);
            for _ in 0..6 {
                sleep(Duration::from_millis(150)).await.unwrap();
                p.data_received(b"GET /tick HTTP/1.1\r\n\r\n");
                settle().await;
            }
            assert!(!t.closed.get());
            assert_eq!(t.output().matches("HTTP/1.1 200 OK").count(), 6);
            assert!(!t.output().contains("408"));
        });
    }

    #[test]
    fn test_total_size_guard() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 64);
            let (p, t) = open(&ctx);
            let mut data = b"POST / HTTP/1.1\r\nContent-Length: 40\r\n\r\n".to_vec();
            data.extend_from_slice(&[b'x'; 40]);
            p.data_received(&data);

            let out = t.output();
            assert!(out.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"), "{out}");
            assert!(out.ends_with("Error: Payload Too Large"));
            assert!(t.closed.get());
        });
    }

    #[test]
    fn test_declared_length_guard() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1000);
            let (p, t) = open(&ctx);
            p.data_received(b"POST /upload HTTP/1.1\r\nContent-Length: 5000\r\n\r\n");

            assert!(t.output().starts_with("HTTP/1.1 413 "));
            assert_eq!(p.state(), ConnectionState::Closed);
            // Anything after the close is ignored
            p.data_received(b"more");
            assert_eq!(t.output().matches("HTTP/1.1").count(), 1);
        });
    }

    #[test]
    fn test_malformed_request_is_bad_request() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"NOT A REQUEST\r\n\r\n");
            let out = t.output();
            assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
            assert!(out.ends_with("Error: Bad Request"));
            assert!(t.closed.get());
        });
    }

    #[test]
    fn test_pipelined_requests_answered_in_order() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c HTT");
            settle().await;
            p.data_received(b"P/1.1\r\n\r\n");
            settle().await;

            let out = t.output();
            let a = out.find("\r\n\r\n/a").unwrap();
            let b = out.find("\r\n\r\n/b").unwrap();
            let c = out.find("\r\n\r\n/c").unwrap();
            assert!(a < b && b < c);
            assert_eq!(p.state(), ConnectionState::KeepAlive);
        });
    }

    #[test]
    fn test_handler_error_keeps_connection() {
        with_handle(|h| async move {
            let handler = |_req: Rc<Request>| async move {
                Err::<Response, _>(HandlerError::internal(anyhow::anyhow!("boom")))
            };
            let ctx = context(h, handler, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"GET / HTTP/1.1\r\n\r\n");
            settle().await;

            let out = t.output();
            assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{out}");
            assert!(out.contains("Connection: keep-alive\r\n"));
            assert!(out.ends_with("An error occurred while generating the request"));
            assert!(!t.closed.get());
            assert_eq!(p.state(), ConnectionState::KeepAlive);
        });
    }

    #[test]
    fn test_handler_panic_is_server_error() {
        with_handle(|h| async move {
            let handler = |req: Rc<Request>| async move {
                if req.url() == "/panic" {
                    panic!("handler bug");
                }
                Ok::<_, HandlerError>(text("fine"))
            };
            let ctx = context(h, handler, Duration::from_millis(500), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"GET /panic HTTP/1.1\r\n\r\n");
            settle().await;

            let out = t.output();
            assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{out}");
            assert!(out.ends_with("An error occurred while generating the request"));
            assert!(!t.closed.get());
            assert_eq!(p.state(), ConnectionState::KeepAlive);

            // The connection keeps serving
            p.data_received(b"GET /ok HTTP/1.1\r\n\r\n");
            settle().await;
            assert!(t.output().ends_with("\r\n\r\nfine"));
            assert!(!t.output().contains("408"));
        });
    }

    #[test]
    fn test_pipelined_bytes_count_toward_size_guard() {
        with_handle(|h| async move {
            let finished = Rc::new(Cell::new(false));
            let flag = Rc::clone(&finished);
            let handler = move |_req: Rc<Request>| {
                let flag = Rc::clone(&flag);
                async move {
                    sleep(Duration::from_secs(5)).await?;
                    flag.set(true);
                    Ok::<_, HandlerError>(text("late"))
                }
            };
            let ctx = context(h, handler, Duration::from_secs(60), 1024);
            let (p, t) = open(&ctx);
            p.data_received(b"GET /slow HTTP/1.1\r\n\r\n");
            settle().await;
            assert_eq!(p.state(), ConnectionState::Dispatched);

            // Within the limit: held for later
            p.data_received(&[b'x'; 600]);
            assert!(t.output().is_empty());
            assert!(!t.closed.get());

            p.data_received(&[b'x'; 600]);
            let out = t.output();
            assert!(out.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"), "{out}");
            assert!(t.closed.get());
            assert_eq!(p.state(), ConnectionState::Closed);
            assert!(format!("{:?}", p).contains("pending: 0"));

            settle().await;
            assert!(!finished.get());
            assert_eq!(t.output().matches("HTTP/1.1").count(), 1);
        });
    }

    #[test]
    fn test_connection_close_honoured() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
            settle().await;
            assert!(t.output().contains("Connection: close\r\n"));
            assert!(t.closed.get());
            assert_eq!(p.state(), ConnectionState::Closed);
        });
    }

    #[test]
    fn test_http10_closes_by_default() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"GET / HTTP/1.0\r\n\r\n");
            settle().await;
            assert!(t.output().starts_with("HTTP/1.0 200 OK\r\n"));
            assert!(t.closed.get());
        });
    }

    #[test]
    fn test_stopping_server_disables_keep_alive() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            ctx.signal.stop();
            p.data_received(b"GET / HTTP/1.1\r\n\r\n");
            settle().await;
            assert!(t.output().contains("Connection: close\r\n"));
            assert!(!t.output().contains("Keep-Alive:"));
            assert!(t.closed.get());
        });
    }

    #[test]
    fn test_close_if_idle() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1 << 20);
            let (idle, idle_t) = open(&ctx);
            let (busy, busy_t) = open(&ctx);
            busy.data_received(b"GET / HTTP/1.1\r\nHost:");

            assert_eq!(ctx.connections.close_idle(), 1);
            assert!(idle_t.closed.get());
            assert!(!busy_t.closed.get());
            assert!(!busy.close_if_idle());
            assert!(idle.close_if_idle());

            idle.connection_lost();
            busy.connection_lost();
            assert!(ctx.connections.is_empty());
        });
    }

    #[test]
    fn test_timeout_cancels_slow_handler() {
        with_handle(|h| async move {
            let finished = Rc::new(Cell::new(false));
            let flag = Rc::clone(&finished);
            let handler = move |_req: Rc<Request>| {
                let flag = Rc::clone(&flag);
                async move {
                    sleep(Duration::from_secs(5)).await?;
                    flag.set(true);
                    Ok::<_, HandlerError>(text("late"))
                }
            };
            let ctx = context(h, handler, Duration::from_millis(100), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"GET /slow HTTP/1.1\r\n\r\n");
            sleep(Duration::from_millis(250)).await.unwrap();

            let out = t.output();
            assert!(out.starts_with("HTTP/1.1 408 Request Timeout\r\n"), "{out}");
            assert_eq!(out.matches("HTTP/1.1").count(), 1);
            assert!(t.closed.get());
            assert!(!finished.get());
        });
    }

    #[test]
    fn test_write_failure_closes() {
        with_handle(|h| async move {
            let ctx = context(h, echo_url, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            t.fail_writes.set(true);
            p.data_received(b"GET / HTTP/1.1\r\n\r\n");
            settle().await;
            assert!(t.closed.get());
            assert_eq!(p.state(), ConnectionState::Closed);
        });
    }

    #[test]
    fn test_connection_lost_cancels_handler() {
        with_handle(|h| async move {
            let handler = |_req: Rc<Request>| async move {
                sleep(Duration::from_secs(5)).await?;
                Ok::<_, HandlerError>(text("late"))
            };
            let ctx = context(h, handler, Duration::from_secs(60), 1 << 20);
            let (p, t) = open(&ctx);
            p.data_received(b"GET / HTTP/1.1\r\n\r\n");
            settle().await;
            p.connection_lost();
            settle().await;
            assert!(t.output().is_empty());
            assert!(ctx.connections.is_empty());
        });
    }
}
