//! Per-method dispatch table

use std::collections::HashMap;
use std::fmt;
use std::future;
use std::rc::Rc;

use crate::error::HttpError;
use crate::handler::{HandlerError, HandlerFuture, RequestHandler};
use crate::request::{Method, Request};

/// Routes a request to the handler registered for its method
///
/// Methods without a handler are rejected with `MethodNotAllowed` (405).
#[derive(Default)]
pub struct MethodDispatch {
    routes: HashMap<Method, Box<dyn RequestHandler>>,
}

impl MethodDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, method: Method, handler: impl RequestHandler + 'static) -> Self {
        self.routes.insert(method, Box::new(handler));
        self
    }

    pub fn get(self, handler: impl RequestHandler + 'static) -> Self {
        self.on(Method::Get, handler)
    }

    pub fn post(self, handler: impl RequestHandler + 'static) -> Self {
        self.on(Method::Post, handler)
    }

    pub fn put(self, handler: impl RequestHandler + 'static) -> Self {
        self.on(Method::Put, handler)
    }

    pub fn patch(self, handler: impl RequestHandler + 'static) -> Self {
        self.on(Method::Patch, handler)
    }

    pub fn delete(self, handler: impl RequestHandler + 'static) -> Self {
        self.on(Method::Delete, handler)
    }

    pub fn allows(&self, method: Method) -> bool {
        self.routes.contains_key(&method)
    }
}

impl RequestHandler for MethodDispatch {
    fn handle(&self, request: Rc<Request>) -> HandlerFuture {
        match self.routes.get(&request.method()) {
            Some(handler) => handler.handle(request),
            None => {
                let err = HttpError::MethodNotAllowed(format!(
                    "Method {} not allowed for URL {}",
                    request.method(),
                    request.url()
                ));
                Box::pin(future::ready(Err(HandlerError::Http(err))))
            }
        }
    }
}

impl fmt::Debug for MethodDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDispatch")
            .field("methods", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{text, Response};
    use coop_runtime::{RuntimeConfig, Scheduler};

    fn req(method: Method) -> Rc<Request> {
        Rc::new(Request::new(method, b"/items", "1.1", Default::default()))
    }

    fn run(d: &MethodDispatch, method: Method) -> Result<Response, HandlerError> {
        let s = Scheduler::with_config(RuntimeConfig::new()).unwrap();
        s.run_until(d.handle(req(method))).unwrap()
    }

    #[test]
    fn test_dispatches_by_method() {
        let d = MethodDispatch::new()
            .get(|_req: Rc<Request>| async { Ok::<_, HandlerError>(text("got")) })
            .post(|_req: Rc<Request>| async { Ok::<_, HandlerError>(text("posted")) });
        assert!(d.allows(Method::Get));
        assert!(!d.allows(Method::Put));
        assert_eq!(run(&d, Method::Post).unwrap().body, b"posted");
    }

    #[test]
    fn test_unknown_method_rejected() {
        let d = MethodDispatch::new().get(|_req: Rc<Request>| async { Ok::<_, HandlerError>(text("got")) });
        match run(&d, Method::Delete) {
            Err(HandlerError::Http(e)) => {
                assert_eq!(e.status_code(), 405);
                assert_eq!(e.to_string(), "Method DELETE not allowed for URL /items");
            }
            _ => panic!("expected a method error"),
        }
    }
}
