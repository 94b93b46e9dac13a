// src/http.rs
use std::time::SystemTime;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    /// Methods defined to carry a request body.
    pub fn has_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"HTTP/1.0" => Some(Version::Http10),
            b"HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Response body source. File bodies hold a path relative to the document
/// root; the engine opens the file during the send phase.
#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    File(String),
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain".to_string(),
            headers: Vec::new(),
            body: Body::Bytes(body.into()),
        }
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: "text/html".to_string(),
            headers: Vec::new(),
            body: Body::Bytes(body.into()),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Self {
                status: 200,
                content_type: "application/json".to_string(),
                headers: Vec::new(),
                body: Body::Bytes(bytes),
            },
            Err(_) => Self::error_page(500),
        }
    }

    /// Static resource under the document root; the engine resolves and
    /// streams it with zero-copy transfer.
    pub fn file(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            status: 200,
            content_type: crate::files::content_type_for(&path),
            headers: Vec::new(),
            body: Body::File(path),
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Canned HTML error page for a standard status code.
    pub fn error_page(status: u16) -> Self {
        let reason = status_reason(status);
        let body = format!(
            "<html><head><title>{status} {reason}</title></head>\
             <body><h1>{status} {reason}</h1></body></html>\n"
        );
        Self {
            status,
            content_type: "text/html".to_string(),
            headers: Vec::new(),
            body: Body::Bytes(body.into_bytes()),
        }
    }

    pub fn not_found() -> Self {
        Self::error_page(404)
    }

    pub fn bad_request() -> Self {
        Self::error_page(400)
    }

    pub fn internal_error() -> Self {
        Self::error_page(500)
    }
}

/// Serialize the status line and header block. Content-Length always
/// reflects the resolved body size (for files, the stat size), and the
/// Connection header records the engine's keep-alive decision.
pub fn serialize_head(rsp: &Response, content_length: u64, keep_alive: bool) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(rsp.status.to_string().as_bytes());
    head.extend_from_slice(b" ");
    head.extend_from_slice(status_reason(rsp.status).as_bytes());
    head.extend_from_slice(b"\r\n");

    head.extend_from_slice(b"Date: ");
    head.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
    head.extend_from_slice(b"\r\n");

    head.extend_from_slice(b"Content-Type: ");
    head.extend_from_slice(rsp.content_type.as_bytes());
    head.extend_from_slice(b"\r\n");

    for (k, v) in &rsp.headers {
        head.extend_from_slice(k.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(v.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    head.extend_from_slice(b"Content-Length: ");
    head.extend_from_slice(content_length.to_string().as_bytes());
    head.extend_from_slice(b"\r\n");

    if keep_alive {
        head.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        head.extend_from_slice(b"Connection: close\r\n");
    }

    head.extend_from_slice(b"\r\n");
    head
}
