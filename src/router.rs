// src/router.rs
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use crate::http::{Method, Response};
use crate::parser::HttpRequest;

pub type Handler = fn(&HttpRequest) -> Response;
pub type ErrorHandler = fn(&HttpRequest) -> Response;

/// Route table plus the error-response factories, injected into every
/// connection instead of living in global state. Unmatched paths fall
/// through to the static-file pipeline: a trailing-slash path serves the
/// directory index, anything else the file itself.
#[derive(Clone)]
pub struct Router {
    routes: HashMap<String, HashMap<Method, Handler>>,
    error_handlers: HashMap<u16, ErrorHandler>,
}

impl Router {
    pub fn new() -> Self {
        let mut error_handlers: HashMap<u16, ErrorHandler> = HashMap::new();
        error_handlers.insert(301, default_moved_permanently);
        error_handlers.insert(400, default_error_400);
        error_handlers.insert(403, default_error_403);
        error_handlers.insert(404, default_error_404);
        error_handlers.insert(405, default_error_405);
        error_handlers.insert(500, default_error_500);

        Self {
            routes: HashMap::new(),
            error_handlers,
        }
    }

    pub fn route(&mut self, method: Method, path: &str, handler: Handler) {
        self.routes
            .entry(path.to_string())
            .or_default()
            .insert(method, handler);
    }

    pub fn get(&mut self, path: &str, handler: Handler) {
        self.route(Method::Get, path, handler);
    }

    pub fn post(&mut self, path: &str, handler: Handler) {
        self.route(Method::Post, path, handler);
    }

    pub fn put(&mut self, path: &str, handler: Handler) {
        self.route(Method::Put, path, handler);
    }

    pub fn delete(&mut self, path: &str, handler: Handler) {
        self.route(Method::Delete, path, handler);
    }

    pub fn patch(&mut self, path: &str, handler: Handler) {
        self.route(Method::Patch, path, handler);
    }

    /// Replace the factory for one standard status code.
    pub fn set_error_handler(&mut self, status: u16, handler: ErrorHandler) {
        self.error_handlers.insert(status, handler);
    }

    pub fn error_response(&self, status: u16, req: &HttpRequest) -> Response {
        match self.error_handlers.get(&status) {
            Some(h) => h(req),
            None => Response::error_page(status),
        }
    }

    /// Produce the response for a fully parsed request. Handler panics are
    /// contained and answered with 500.
    pub fn dispatch(&self, req: &HttpRequest) -> Response {
        if req.is_bad() {
            return self.error_response(400, req);
        }

        match self.routes.get(req.path()) {
            Some(by_method) => match by_method.get(&req.method()) {
                Some(handler) => {
                    match panic::catch_unwind(AssertUnwindSafe(|| handler(req))) {
                        Ok(rsp) => rsp,
                        Err(_) => {
                            tracing::error!("handler for {} panicked", req.path());
                            self.error_response(500, req)
                        }
                    }
                }
                None => self.error_response(405, req),
            },
            None => {
                // static fallback: "/" and "/foo/" mean the directory index
                if req.path().ends_with('/') {
                    Response::file(format!("{}index.html", req.path()))
                } else {
                    Response::file(req.path())
                }
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn default_moved_permanently(req: &HttpRequest) -> Response {
    let location = format!("{}/", req.path());
    Response::error_page(301).header("Location", location)
}

fn default_error_400(_req: &HttpRequest) -> Response {
    Response::error_page(400)
}

fn default_error_403(_req: &HttpRequest) -> Response {
    Response::error_page(403)
}

fn default_error_404(_req: &HttpRequest) -> Response {
    Response::error_page(404)
}

fn default_error_405(_req: &HttpRequest) -> Response {
    Response::error_page(405)
}

fn default_error_500(_req: &HttpRequest) -> Response {
    Response::error_page(500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Body;

    fn parsed(raw: &[u8]) -> HttpRequest {
        let mut req = HttpRequest::new();
        req.parse(raw, 0);
        req
    }

    fn hello(_req: &HttpRequest) -> Response {
        Response::ok("hello")
    }

    #[test]
    fn dispatches_registered_handler() {
        let mut router = Router::new();
        router.get("/hi", hello);

        let req = parsed(b"GET /hi HTTP/1.1\r\n\r\n");
        let rsp = router.dispatch(&req);
        assert_eq!(rsp.status, 200);
    }

    #[test]
    fn wrong_method_is_405() {
        let mut router = Router::new();
        router.get("/hi", hello);

        let req = parsed(b"POST /hi HTTP/1.1\r\n\r\n");
        let rsp = router.dispatch(&req);
        assert_eq!(rsp.status, 405);
    }

    #[test]
    fn bad_request_short_circuits_routing() {
        let router = Router::new();
        let req = parsed(b"GET/hi HTTP/1.1\r\n\r\n");
        assert!(req.is_bad());
        let rsp = router.dispatch(&req);
        assert_eq!(rsp.status, 400);
    }

    #[test]
    fn unmatched_path_falls_back_to_static_file() {
        let router = Router::new();

        let req = parsed(b"GET /assets/logo.png HTTP/1.1\r\n\r\n");
        let rsp = router.dispatch(&req);
        assert!(matches!(rsp.body, Body::File(ref p) if p == "/assets/logo.png"));

        let req = parsed(b"GET /docs/ HTTP/1.1\r\n\r\n");
        let rsp = router.dispatch(&req);
        assert!(matches!(rsp.body, Body::File(ref p) if p == "/docs/index.html"));
    }

    #[test]
    fn panicking_handler_becomes_500() {
        fn boom(_req: &HttpRequest) -> Response {
            panic!("handler exploded");
        }
        let mut router = Router::new();
        router.get("/boom", boom);

        let req = parsed(b"GET /boom HTTP/1.1\r\n\r\n");
        let rsp = router.dispatch(&req);
        assert_eq!(rsp.status, 500);
    }

    #[test]
    fn error_handler_can_be_overridden() {
        fn custom_404(_req: &HttpRequest) -> Response {
            Response::ok("custom").status(404)
        }
        let mut router = Router::new();
        router.set_error_handler(404, custom_404);

        let req = parsed(b"GET /nope HTTP/1.1\r\n\r\n");
        let rsp = router.error_response(404, &req);
        assert_eq!(rsp.status, 404);
        assert!(matches!(rsp.body, Body::Bytes(ref b) if b == b"custom"));
    }

    #[test]
    fn redirect_points_at_directory() {
        let router = Router::new();
        let req = parsed(b"GET /docs HTTP/1.1\r\n\r\n");
        let rsp = router.error_response(301, &req);
        assert_eq!(rsp.status, 301);
        assert!(
            rsp.headers
                .iter()
                .any(|(k, v)| k == "Location" && v == "/docs/")
        );
    }
}
