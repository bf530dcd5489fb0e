//! # coop HTTP demo server
//!
//! One thread, one scheduler, one task per connection and per request.
//! The routes show handlers awaiting the cooperative primitives:
//!
//! | Route           | What it shows                                    |
//! |-----------------|--------------------------------------------------|
//! | `GET /`         | plain text                                       |
//! | `GET /counter`  | read-modify-write under a `Lock` across a sleep  |
//! | `GET /limited`  | at most 2 requests inside, via a `Semaphore`     |
//! | `POST /echo`    | JSON body echoed back                            |
//! | `GET /static/*` | files from `COOP_STATIC_DIR`                     |
//!
//! ## Usage
//!
//!     cargo run -p coop-httpd --release -- [--host 0.0.0.0] [--port 8000] [--debug]
//!
//! Logging follows `RUST_LOG`, else `COOP_LOG_LEVEL` (default `info`).

use std::cell::Cell;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use coop::http::response::{file, json, text};
use coop::http::{HandlerResult, HttpError, Method, Request, Server, ServerConfig};
use coop::{env_get_str, sleep, Lock, Semaphore};
use tracing_subscriber::EnvFilter;

struct AppState {
    counter_lock: Lock,
    counter: Cell<u64>,
    limiter: Semaphore,
    static_dir: PathBuf,
}

async fn route(state: Rc<AppState>, req: Rc<Request>) -> HandlerResult {
    match (req.method(), req.url()) {
        (Method::Get, "/") => Ok(text("Hello from coop!\n")),
        (Method::Get, "/counter") => {
            let _guard = state.counter_lock.lock().await?;
            let seen = state.counter.get();
            // Another request would read the same value here without the lock
            sleep(Duration::from_millis(10)).await?;
            state.counter.set(seen + 1);
            Ok(text(format!("{}\n", seen + 1)))
        }
        (Method::Get, "/limited") => {
            let _permit = state.limiter.permit().await?;
            sleep(Duration::from_millis(100)).await?;
            Ok(text(format!("done, {} slots free\n", state.limiter.value())))
        }
        (Method::Post, "/echo") => Ok(json(req.json()?)),
        (Method::Get, path) if path.starts_with("/static/") => {
            let rel = &path["/static/".len()..];
            let location = safe_join(&state.static_dir, rel)
                .ok_or_else(|| HttpError::NotFound(format!("Requested URL {} not found", path)))?;
            Ok(file(location, None)?)
        }
        (_, "/" | "/counter" | "/limited" | "/echo") => Err(HttpError::MethodNotAllowed(format!(
            "Method {} not allowed for URL {}",
            req.method(),
            req.url()
        ))
        .into()),
        (_, path) => Err(HttpError::NotFound(format!("Requested URL {} not found", path)).into()),
    }
}

/// `base/rel`, refusing anything that would leave `base`
fn safe_join(base: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(base.join(rel))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env_get_str("COOP_LOG_LEVEL", "info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    // Phase 1: COOP_* env vars
    let mut config = ServerConfig::from_env();

    // Phase 2: CLI flags override env vars
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-h" => {
                i += 1;
                if let Some(h) = args.get(i) {
                    config.host = h.clone();
                }
            }
            "--port" | "-p" => {
                i += 1;
                if let Some(p) = args.get(i).and_then(|s| s.parse().ok()) {
                    config.port = p;
                }
            }
            "--debug" => config.debug = true,
            other => tracing::warn!(arg = other, "ignoring unknown argument"),
        }
        i += 1;
    }

    let state = Rc::new(AppState {
        counter_lock: Lock::new(),
        counter: Cell::new(0),
        limiter: Semaphore::new(2)?,
        static_dir: PathBuf::from(env_get_str("COOP_STATIC_DIR", ".")),
    });

    let handler = move |req: Rc<Request>| route(Rc::clone(&state), req);

    Server::new(config, handler)
        .after_start(|ctx| async move {
            if let Some(addr) = ctx.local_addr {
                tracing::info!("coop-httpd: listening on http://{}/", addr);
            }
            Ok(())
        })
        .after_stop(|_ctx| async move {
            tracing::info!("coop-httpd: shutdown complete");
            Ok(())
        })
        .serve()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_join() {
        let base = Path::new("/srv");
        assert_eq!(safe_join(base, "a/b.txt"), Some(PathBuf::from("/srv/a/b.txt")));
        assert_eq!(safe_join(base, "../etc/passwd"), None);
        assert_eq!(safe_join(base, "/etc/passwd"), None);
    }
}
