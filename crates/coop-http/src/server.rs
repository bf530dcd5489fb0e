//! Server loop
//!
//! ```text
//!   before_start ─▶ bind ─▶ after_start ─▶ run_forever ─────────────┐
//!                                            │  accept task          │ stop()
//!                                            │  one reader task and  │ SIGINT/SIGTERM
//!                                            │  one writer task per  │
//!                                            │  connection           │
//!                                            ▼                       │
//!   after_stop ◀─ wait for connections ◀─ close idle ◀─ before_stop ◀┘
//! ```
//!
//! Draining: once stopped, the listener is closed, kept-alive connections
//! that are idle are closed at once, and in-flight requests finish with
//! `Connection: close`. The server returns when no connection is left.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use coop_core::{SchedError, SchedResult};
use coop_runtime::{sleep, BindOptions, Handle, RuntimeConfig, Scheduler, StopHandle, TcpListener, TcpStream};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::ServerConfig;
use crate::handler::{ErrorHandler, RequestHandler};
use crate::protocol::{ConnectionSet, HttpProtocol, ProtocolContext, ServerSignal};
use crate::transport::{StreamTransport, Transport};

const READ_BUF_SIZE: usize = 16 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

static STOP_SIGNALLED: AtomicBool = AtomicBool::new(false);

/// What lifecycle hooks see
#[derive(Clone)]
pub struct ServerContext {
    pub handle: Handle,
    /// `None` before the listener is bound
    pub local_addr: Option<SocketAddr>,
    /// Stops the server from any thread
    pub stop: StopHandle,
}

pub type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;
pub type Hook = Box<dyn FnOnce(ServerContext) -> HookFuture>;

#[derive(Default)]
struct Hooks {
    before_start: Vec<Hook>,
    after_start: Vec<Hook>,
    before_stop: Vec<Hook>,
    after_stop: Vec<Hook>,
}

fn hook<F, Fut>(f: F) -> Hook
where
    F: FnOnce(ServerContext) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

pub struct Server {
    config: ServerConfig,
    handler: Rc<dyn RequestHandler>,
    errors: ErrorHandler,
    hooks: Hooks,
}

impl Server {
    pub fn new(config: ServerConfig, handler: impl RequestHandler + 'static) -> Self {
        let errors = ErrorHandler::new(config.debug);
        Self {
            config,
            handler: Rc::new(handler),
            errors,
            hooks: Hooks::default(),
        }
    }

    pub fn error_handler(mut self, errors: ErrorHandler) -> Self {
        self.errors = errors;
        self
    }

    /// Runs before the listener is bound; a failure aborts startup
    pub fn before_start<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(ServerContext) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.hooks.before_start.push(hook(f));
        self
    }

    /// Runs once the server is listening; a failure aborts startup
    pub fn after_start<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(ServerContext) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.hooks.after_start.push(hook(f));
        self
    }

    /// Runs when a stop was requested, before draining
    pub fn before_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(ServerContext) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.hooks.before_stop.push(hook(f));
        self
    }

    /// Runs after every connection has drained
    pub fn after_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(ServerContext) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        self.hooks.after_stop.push(hook(f));
        self
    }

    /// Run until stopped, then drain
    pub fn serve(self) -> anyhow::Result<()> {
        let Server {
            config,
            handler,
            errors,
            hooks,
        } = self;
        config.validate()?;

        let sched = Scheduler::with_config(RuntimeConfig::from_env().debug(config.debug))?;
        let handle = sched.handle();
        let mut ctx = ServerContext {
            handle: handle.clone(),
            local_addr: None,
            stop: handle.stop_handle(),
        };

        run_hooks(&sched, "before_start", hooks.before_start, &ctx)?;

        let addr = config.socket_addr()?;
        let opts = BindOptions {
            backlog: config.backlog,
            reuse_port: config.reuse_port,
        };
        let listener = match TcpListener::bind(addr, &opts) {
            Ok(listener) => Rc::new(listener),
            Err(e) => {
                tracing::error!(%addr, error = %e, "Unable to start server");
                return Err(e).with_context(|| format!("binding {}", addr));
            }
        };
        let local = listener.local_addr()?;
        ctx.local_addr = Some(local);
        tracing::info!(addr = %local, debug = config.debug, "listening");

        run_hooks(&sched, "after_start", hooks.after_start, &ctx)?;

        if config.handle_signals {
            install_signal_handlers()?;
            sched.spawn(watch_signals(handle.clone(), config.drain_poll));
        }

        let signal = Rc::new(ServerSignal::new());
        let connections = Rc::new(ConnectionSet::new());
        let protocol_ctx = Rc::new(ProtocolContext {
            handle: handle.clone(),
            handler,
            errors: Rc::new(errors),
            signal: Rc::clone(&signal),
            connections: Rc::clone(&connections),
            request_timeout: config.request_timeout,
            request_max_size: config.request_max_size,
            limits: config.limits,
        });
        let acceptor = sched.spawn(accept_loop(Rc::clone(&listener), protocol_ctx));

        sched.run_forever()?;

        tracing::info!(connections = connections.len(), "Stop requested, draining connections");
        if let Err(e) = run_hooks(&sched, "before_stop", hooks.before_stop, &ctx) {
            tracing::error!(error = ?e, "before_stop hook failed");
        }

        acceptor.cancel();
        if let Some(e) = acceptor_failure(sched.run_until(acceptor)) {
            tracing::error!(error = %e, "accept loop failed");
        }
        drop(listener);

        signal.stop();
        let closed = connections.close_idle();
        tracing::debug!(closed, remaining = connections.len(), "idle connections closed");
        let poll = config.drain_poll;
        let waiting = Rc::clone(&connections);
        sched.run_until(async move {
            while !waiting.is_empty() {
                sleep(poll).await?;
            }
            Ok::<_, SchedError>(())
        })??;

        if let Err(e) = run_hooks(&sched, "after_stop", hooks.after_stop, &ctx) {
            tracing::error!(error = ?e, "after_stop hook failed");
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

fn run_hooks(sched: &Scheduler, stage: &'static str, hooks: Vec<Hook>, ctx: &ServerContext) -> anyhow::Result<()> {
    for hook in hooks {
        tracing::debug!(stage, "running hook");
        sched
            .run_until(hook(ctx.clone()))?
            .with_context(|| format!("{} hook failed", stage))?;
    }
    Ok(())
}

/// Error from stopping the acceptor, if it is more than the expected cancel
///
/// The layers are the scheduler run, the join, and the loop itself.
fn acceptor_failure(outcome: SchedResult<SchedResult<SchedResult<()>>>) -> Option<SchedError> {
    match outcome.and_then(|joined| joined).and_then(|looped| looped) {
        Ok(()) | Err(SchedError::Cancelled) => None,
        Err(e) => Some(e),
    }
}

async fn accept_loop(listener: Rc<TcpListener>, ctx: Rc<ProtocolContext>) -> SchedResult<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(SchedError::Cancelled) => return Err(SchedError::Cancelled),
            Err(e) => {
                // Typically EMFILE; give connections a chance to close
                tracing::error!(error = %e, "accept failed");
                sleep(ACCEPT_BACKOFF).await?;
                continue;
            }
        };
        tracing::trace!(%peer, "accepted");
        ctx.handle.spawn(serve_connection(stream, Rc::clone(&ctx)));
    }
}

/// Reader side of one connection
async fn serve_connection(stream: TcpStream, ctx: Rc<ProtocolContext>) {
    let transport = Rc::new(StreamTransport::new(stream));
    let protocol = HttpProtocol::new(Rc::clone(&ctx));
    protocol.connection_made(Rc::clone(&transport) as Rc<dyn Transport>);

    let writer = {
        let transport = Rc::clone(&transport);
        ctx.handle.spawn(async move { transport.run_writer().await })
    };

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match transport.stream().read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => protocol.data_received(&buf[..n]),
            Err(SchedError::Cancelled) => break,
            Err(e) => {
                tracing::debug!(conn = protocol.id(), error = %e, "read failed");
                break;
            }
        }
    }

    protocol.connection_lost();
    transport.close();
    match writer.await {
        Ok(Ok(())) | Err(SchedError::Cancelled) => {}
        Ok(Err(e)) | Err(e) => tracing::debug!(conn = protocol.id(), error = %e, "write failed"),
    }
}

extern "C" fn on_stop_signal(_sig: libc::c_int) {
    STOP_SIGNALLED.store(true, Ordering::Release);
}

/// SIGINT and SIGTERM request a stop; SIGPIPE is ignored
fn install_signal_handlers() -> io::Result<()> {
    let stop = SigAction::new(SigHandler::Handler(on_stop_signal), SaFlags::SA_RESTART, SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only stores to an atomic
    unsafe {
        signal::sigaction(Signal::SIGINT, &stop)?;
        signal::sigaction(Signal::SIGTERM, &stop)?;
        signal::sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

async fn watch_signals(handle: Handle, poll: Duration) -> SchedResult<()> {
    loop {
        sleep(poll).await?;
        if STOP_SIGNALLED.swap(false, Ordering::AcqRel) {
            tracing::info!("stop signal received");
            handle.stop();
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptor_failure_ignores_cancel() {
        assert_eq!(acceptor_failure(Ok(Ok(Ok(())))), None);
        assert_eq!(acceptor_failure(Ok(Ok(Err(SchedError::Cancelled)))), None);
        assert_eq!(acceptor_failure(Ok(Err(SchedError::Cancelled))), None);
        assert_eq!(acceptor_failure(Err(SchedError::Cancelled)), None);
    }

    #[test]
    fn test_acceptor_failure_reports_errors() {
        assert_eq!(
            acceptor_failure(Ok(Err(SchedError::Panicked("accept".into())))),
            Some(SchedError::Panicked("accept".into()))
        );
        assert_eq!(acceptor_failure(Err(SchedError::Stalled)), Some(SchedError::Stalled));
        assert_eq!(
            acceptor_failure(Ok(Ok(Err(SchedError::NotRunning)))),
            Some(SchedError::NotRunning)
        );
    }
}
