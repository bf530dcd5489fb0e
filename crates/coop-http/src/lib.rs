//! # coop-http
//!
//! HTTP/1.x server on the coop scheduler.
//!
//! ## Architecture
//!
//! ```text
//!   TcpListener ──accept──▶ reader task ──bytes──▶ HttpProtocol ──▶ RequestParser
//!                                                      │
//!                                 Rc<Request> ─────────┤ spawn
//!                                                      ▼
//!                                             handler task (RequestHandler)
//!                                                      │ Result<Response, HandlerError>
//!                                                      ▼
//!                    writer task ◀── StreamTransport ◀── Response::output
//! ```
//!
//! Everything runs on one thread. A handler is an async function of the
//! request; it may await sleeps, sockets and the `coop-core` primitives
//! without blocking other connections.
//!
//! ## Usage
//!
//! ```ignore
//! use coop_http::{response::text, Server, ServerConfig};
//!
//! Server::new(ServerConfig::from_env(), |req: Rc<Request>| async move {
//!     Ok(text(format!("hello from {}", req.url())))
//! })
//! .serve()?;
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod headers;
pub mod parser;
pub mod protocol;
pub mod request;
pub mod response;
pub mod server;
pub mod status;
pub mod transport;

mod form;

pub use config::{ConfigError, ServerConfig};
pub use dispatch::MethodDispatch;
pub use error::{ErrorKind, HttpError};
pub use handler::{ErrorHandler, HandlerError, HandlerFuture, HandlerResult, RequestHandler};
pub use headers::Headers;
pub use parser::{ParseError, ParserLimits, RequestParser};
pub use protocol::{ConnectionSet, ConnectionState, HttpProtocol, ProtocolContext, ServerSignal};
pub use request::{File, Method, Request, RequestParameters};
pub use response::Response;
pub use server::{Server, ServerContext};
pub use transport::{StreamTransport, Transport};
