// src/parser.rs
use std::collections::HashMap;

use crate::http::{Method, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Complete,
}

/// Incremental HTTP/1.x request parser.
///
/// `parse` may be called repeatedly as more bytes arrive; each call picks
/// up where the previous one stopped and returns how many bytes it
/// consumed. The state only ever advances; a malformed input sets the
/// bad-request flag and forces the state to `Complete`, short-circuiting
/// everything that follows.
#[derive(Debug)]
pub struct HttpRequest {
    state: ParseState,
    bad: bool,
    method: Method,
    path: String,
    version: Option<Version>,
    params: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    content_length: Option<usize>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            bad: false,
            method: Method::Unknown,
            path: String::new(),
            version: None,
            params: HashMap::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            content_length: None,
        }
    }

    /// Clear all state for the next request on a kept-alive connection.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consume as much of `data[start..]` as the current phase allows.
    /// Returns the number of bytes consumed by this call; zero means the
    /// parser needs more input (or is already complete).
    pub fn parse(&mut self, data: &[u8], start: usize) -> usize {
        let mut consumed = 0;

        if self.state == ParseState::RequestLine {
            consumed += self.parse_request_line(data, start);
        }
        if self.state == ParseState::Headers {
            consumed += self.parse_headers(data, start + consumed);
        }
        if self.state == ParseState::Body {
            consumed += self.parse_body(data, start + consumed);
        }

        consumed
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Header lookup; names are matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Force the bad-request outcome from outside the parser (e.g. when
    /// the request exceeds the configured size limit).
    pub fn mark_bad(&mut self) {
        self.set_bad();
    }

    fn set_bad(&mut self) {
        self.bad = true;
        self.state = ParseState::Complete;
    }

    fn parse_request_line(&mut self, data: &[u8], start: usize) -> usize {
        let Some(line_end) = find_crlf(data, start) else {
            return 0; // wait for a full line
        };
        let line = &data[start..line_end];

        let Ok(line) = std::str::from_utf8(line) else {
            self.set_bad();
            return 0;
        };

        let Some(sp1) = line.find(' ') else {
            self.set_bad();
            return 0;
        };
        let method = Method::from_bytes(line[..sp1].as_bytes());
        if method == Method::Unknown {
            self.set_bad();
            return 0;
        }

        let rest = &line[sp1 + 1..];
        let Some(sp2) = rest.find(' ') else {
            self.set_bad();
            return 0;
        };
        let uri = &rest[..sp2];
        if !self.parse_uri(uri) {
            self.set_bad();
            return 0;
        }

        let Some(version) = Version::from_bytes(rest[sp2 + 1..].as_bytes()) else {
            self.set_bad();
            return 0;
        };

        self.method = method;
        self.version = Some(version);
        self.state = ParseState::Headers;
        line.len() + 2
    }

    /// Split `path?k1=v1&k2=v2` into the path and its query map.
    /// Duplicate keys keep the last value.
    fn parse_uri(&mut self, uri: &str) -> bool {
        if uri.is_empty() {
            return false;
        }

        let Some(qmark) = uri.find('?') else {
            self.path = uri.to_string();
            return true;
        };

        let path = &uri[..qmark];
        if path.is_empty() {
            return false;
        }
        let raw_params = &uri[qmark + 1..];
        if raw_params.is_empty() {
            // a "?" with nothing behind it
            return false;
        }

        for pair in raw_params.split('&') {
            let Some(eq) = pair.find('=') else {
                return false;
            };
            let key = &pair[..eq];
            if key.is_empty() {
                return false;
            }
            self.params
                .insert(key.to_string(), pair[eq + 1..].to_string());
        }

        self.path = path.to_string();
        true
    }

    fn parse_headers(&mut self, data: &[u8], start: usize) -> usize {
        let mut consumed = 0;
        let mut cursor = start;

        loop {
            let Some(line_end) = find_crlf(data, cursor) else {
                return consumed; // wait for a full line
            };

            if line_end == cursor {
                // blank line terminates the header block
                consumed += 2;
                self.state = if self.method.has_body() {
                    ParseState::Body
                } else {
                    ParseState::Complete
                };
                return consumed;
            }

            let Ok(line) = std::str::from_utf8(&data[cursor..line_end]) else {
                self.set_bad();
                return consumed;
            };
            let Some(colon) = line.find(':') else {
                self.set_bad();
                return consumed;
            };
            let key = &line[..colon];
            if key.is_empty() {
                self.set_bad();
                return consumed;
            }
            let value = line[colon + 1..].trim_start();

            self.headers
                .insert(key.to_ascii_lowercase(), value.to_string());

            consumed += line.len() + 2;
            cursor = line_end + 2;
        }
    }

    fn parse_body(&mut self, data: &[u8], start: usize) -> usize {
        let need = match self.content_length {
            Some(n) => n,
            None => match self.header("content-length") {
                // No declared length: the body phase ends with an empty body.
                None => {
                    self.state = ParseState::Complete;
                    return 0;
                }
                Some(v) => match v.trim().parse::<usize>() {
                    Ok(n) => {
                        self.content_length = Some(n);
                        n
                    }
                    Err(_) => {
                        self.set_bad();
                        return 0;
                    }
                },
            },
        };

        if self.body.len() >= need {
            self.state = ParseState::Complete;
            return 0;
        }

        let avail = data.len().saturating_sub(start);
        let take = (need - self.body.len()).min(avail);
        self.body.extend_from_slice(&data[start..start + take]);

        if self.body.len() == need {
            self.state = ParseState::Complete;
        }
        take
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(data: &[u8], start: usize) -> Option<usize> {
    if start >= data.len() {
        return None;
    }
    data[start..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| start + p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(req: &mut HttpRequest, data: &[u8]) -> usize {
        let mut parsed = 0;
        parsed += req.parse(data, parsed);
        parsed
    }

    #[test]
    fn get_with_query() {
        let data = b"GET /search?q=test&page=2 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        let mut req = HttpRequest::new();
        let consumed = parse_all(&mut req, data);

        assert!(req.is_complete());
        assert!(!req.is_bad());
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/search");
        assert_eq!(req.param("q"), Some("test"));
        assert_eq!(req.param("page"), Some("2"));
        assert_eq!(req.header("Host"), Some("x"));
        assert_eq!(req.header("connection"), Some("close"));
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn missing_space_is_bad_request() {
        let data = b"GET/search HTTP/1.1\r\n";
        let mut req = HttpRequest::new();
        req.parse(data, 0);

        assert!(req.is_bad());
        assert!(req.is_complete());
        // once bad, further input is ignored
        assert_eq!(req.parse(b"Host: x\r\n\r\n", 0), 0);
    }

    #[test]
    fn resumable_over_arbitrary_chunks() {
        let data: &[u8] =
            b"POST /submit?a=1 HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\n\r\nhello world";

        // parse whole-buffer once for the reference result
        let mut whole = HttpRequest::new();
        let whole_consumed = whole.parse(data, 0);

        // feed the same bytes one at a time through a growing buffer
        let mut chunked = HttpRequest::new();
        let mut buf = Vec::new();
        let mut parsed = 0;
        for &b in data {
            buf.push(b);
            parsed += chunked.parse(&buf, parsed);
        }

        assert!(whole.is_complete() && chunked.is_complete());
        assert_eq!(parsed, whole_consumed);
        assert_eq!(parsed, data.len());
        assert_eq!(chunked.method(), whole.method());
        assert_eq!(chunked.path(), whole.path());
        assert_eq!(chunked.param("a"), Some("1"));
        assert_eq!(chunked.body(), whole.body());
        assert_eq!(chunked.body(), b"hello world");
    }

    #[test]
    fn post_body_in_two_chunks() {
        let head = b"POST /data HTTP/1.1\r\nContent-Length: 27\r\n\r\n";
        let body = b"abcdefghijklmnopqrstuvwxyz!";
        assert_eq!(body.len(), 27);

        let mut req = HttpRequest::new();
        let mut buf = Vec::from(&head[..]);
        buf.extend_from_slice(&body[..10]);
        let mut parsed = req.parse(&buf, 0);
        assert!(!req.is_complete());

        buf.extend_from_slice(&body[10..]);
        parsed += req.parse(&buf, parsed);

        assert!(req.is_complete());
        assert!(!req.is_bad());
        assert_eq!(req.body(), &body[..]);
        assert_eq!(parsed, head.len() + body.len());
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let data = b"GET / HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n\r\n";
        let mut req = HttpRequest::new();
        let consumed = req.parse(data, 0);

        assert!(req.is_complete());
        assert_eq!(consumed, b"GET / HTTP/1.1\r\n\r\n".len());
    }

    #[test]
    fn post_without_content_length_completes_empty() {
        let data = b"POST /x HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut req = HttpRequest::new();
        req.parse(data, 0);

        assert!(req.is_complete());
        assert!(!req.is_bad());
        assert!(req.body().is_empty());
    }

    #[test]
    fn malformed_content_length_is_bad() {
        let data = b"POST /x HTTP/1.1\r\nContent-Length: many\r\n\r\n";
        let mut req = HttpRequest::new();
        req.parse(data, 0);

        assert!(req.is_bad());
        assert!(req.is_complete());
    }

    #[test]
    fn unknown_method_and_version_are_bad() {
        let mut req = HttpRequest::new();
        req.parse(b"BREW /pot HTTP/1.1\r\n", 0);
        assert!(req.is_bad());

        let mut req = HttpRequest::new();
        req.parse(b"GET /pot HTTP/2.0\r\n", 0);
        assert!(req.is_bad());
    }

    #[test]
    fn query_edge_cases() {
        // dangling '?'
        let mut req = HttpRequest::new();
        req.parse(b"GET /p? HTTP/1.1\r\n\r\n", 0);
        assert!(req.is_bad());

        // pair without '='
        let mut req = HttpRequest::new();
        req.parse(b"GET /p?flag HTTP/1.1\r\n\r\n", 0);
        assert!(req.is_bad());

        // empty value is fine, duplicate key keeps the last value
        let mut req = HttpRequest::new();
        req.parse(b"GET /p?a=&a=2 HTTP/1.1\r\n\r\n", 0);
        assert!(!req.is_bad());
        assert_eq!(req.param("a"), Some("2"));
    }

    #[test]
    fn header_without_colon_is_bad() {
        let mut req = HttpRequest::new();
        req.parse(b"GET / HTTP/1.1\r\nbogus line\r\n\r\n", 0);
        assert!(req.is_bad());
    }

    #[test]
    fn incomplete_line_waits_without_state_change() {
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(b"GET /index.html HTT", 0), 0);
        assert!(!req.is_complete());
        assert!(!req.is_bad());
    }

    #[test]
    fn reset_clears_everything() {
        let mut req = HttpRequest::new();
        req.parse(b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\n\r\n", 0);
        assert!(req.is_complete());

        req.reset();
        assert!(!req.is_complete());
        assert_eq!(req.path(), "");
        assert!(req.params().is_empty());
        assert!(req.headers().is_empty());
    }
}
