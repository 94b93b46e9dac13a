// src/conn.rs
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

use libc::c_int;

use crate::config::ServerConf;
use crate::error::EngineResult;
use crate::files;
use crate::http::{self, Body};
use crate::metrics::EngineMetrics;
use crate::parser::HttpRequest;
use crate::router::Router;
use crate::syscalls;

pub type RawFd = c_int;

/// Owned file descriptor; dropping it closes the descriptor exactly once.
#[derive(Debug)]
pub struct FdGuard(RawFd);

impl FdGuard {
    pub fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

/// Which half of the exchange a dispatched task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Read,
    Write,
}

/// What the reactor should do with the connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    AwaitRead,
    AwaitWrite,
    Close,
}

#[derive(Debug)]
enum SendBody {
    Empty,
    Bytes(Vec<u8>),
    File { fd: FdGuard, len: u64 },
}

impl SendBody {
    fn len(&self) -> u64 {
        match self {
            SendBody::Empty => 0,
            SendBody::Bytes(b) => b.len() as u64,
            SendBody::File { len, .. } => *len,
        }
    }
}

/// Two-phase response streamer: the head (status line + headers) and the
/// body each carry their own done flag and byte offset, so a short write
/// suspends the phase and the next writable event resumes exactly where
/// the socket stopped accepting bytes.
#[derive(Debug)]
struct SendState {
    head: Vec<u8>,
    head_sent: usize,
    head_done: bool,
    body: SendBody,
    body_sent: u64,
    body_done: bool,
    keep_alive: bool,
}

impl SendState {
    fn new(head: Vec<u8>, body: SendBody, keep_alive: bool) -> Self {
        let body_done = body.len() == 0;
        Self {
            head_done: head.is_empty(),
            head,
            head_sent: 0,
            body,
            body_sent: 0,
            body_done,
            keep_alive,
        }
    }

    fn finished(&self) -> bool {
        self.head_done && self.body_done
    }

    /// Scatter-write the remaining head and in-memory body in one call
    /// per iteration. Returns Ok(true) once everything is flushed,
    /// Ok(false) when the socket stops accepting bytes.
    fn pump_memory<W>(&mut self, mut write_vectored: W) -> EngineResult<bool>
    where
        W: FnMut(&[&[u8]]) -> EngineResult<Option<usize>>,
    {
        loop {
            let head_rest = &self.head[self.head_sent..];
            let body_rest: &[u8] = match &self.body {
                SendBody::Bytes(b) => &b[self.body_sent as usize..],
                _ => &[],
            };

            if head_rest.is_empty() && body_rest.is_empty() {
                self.head_done = true;
                self.body_done = true;
                return Ok(true);
            }

            let mut bufs: Vec<&[u8]> = Vec::with_capacity(2);
            if !head_rest.is_empty() {
                bufs.push(head_rest);
            }
            if !body_rest.is_empty() {
                bufs.push(body_rest);
            }

            match write_vectored(&bufs)? {
                None | Some(0) => return Ok(false),
                Some(mut n) => {
                    let to_head = n.min(head_rest.len());
                    self.head_sent += to_head;
                    n -= to_head;
                    if self.head_sent == self.head.len() {
                        self.head_done = true;
                    }
                    self.body_sent += n as u64;
                    if self.body_sent == self.body.len() {
                        self.body_done = true;
                    }
                }
            }
        }
    }

    /// File-backed variant: plain writes for the head, then bounded
    /// zero-copy chunks for the body. `send_chunk` receives the current
    /// body offset and the bytes still to move.
    fn pump_file<Wh, Wf>(&mut self, mut write_head: Wh, mut send_chunk: Wf) -> EngineResult<bool>
    where
        Wh: FnMut(&[u8]) -> EngineResult<Option<usize>>,
        Wf: FnMut(u64, u64) -> EngineResult<Option<usize>>,
    {
        while !self.head_done {
            let rest = &self.head[self.head_sent..];
            if rest.is_empty() {
                self.head_done = true;
                break;
            }
            match write_head(rest)? {
                None | Some(0) => return Ok(false),
                Some(n) => {
                    self.head_sent += n;
                    if self.head_sent == self.head.len() {
                        self.head_done = true;
                    }
                }
            }
        }

        let total = self.body.len();
        while self.body_sent < total {
            match send_chunk(self.body_sent, total - self.body_sent)? {
                None | Some(0) => return Ok(false),
                Some(n) => self.body_sent += n as u64,
            }
        }
        self.body_done = true;
        Ok(true)
    }
}

/// One accepted socket and everything needed to serve it: the growable
/// read buffer with its parse offset, the incremental request parser, and
/// the in-flight response. Exactly one task may hold a Connection at a
/// time; the reactor's slot table enforces that structurally.
#[derive(Debug)]
pub struct Connection {
    sock: FdGuard,
    read_buf: Vec<u8>,
    parsed: usize,
    req: HttpRequest,
    send: Option<SendState>,
    served: u32,
}

impl Connection {
    pub fn new(sock: FdGuard, read_chunk: usize) -> Self {
        Self {
            sock,
            read_buf: Vec::with_capacity(read_chunk),
            parsed: 0,
            req: HttpRequest::new(),
            send: None,
            served: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.sock.raw()
    }

    /// Run one parse or respond step. Never blocks: would-block outcomes
    /// are reported as the interest to re-arm.
    pub fn step(
        &mut self,
        kind: StepKind,
        router: &Router,
        conf: &ServerConf,
        metrics: &EngineMetrics,
    ) -> StepOutcome {
        match kind {
            StepKind::Read => self.on_readable(conf),
            StepKind::Write => self.on_writable(router, conf, metrics),
        }
    }

    /// Drain the socket, feed the parser, and decide what to wait for.
    fn on_readable(&mut self, conf: &ServerConf) -> StepOutcome {
        loop {
            let old_len = self.read_buf.len();
            self.read_buf.resize(old_len + conf.read_chunk_size, 0);
            match syscalls::read_nonblocking(self.sock.raw(), &mut self.read_buf[old_len..]) {
                Ok(None) => {
                    self.read_buf.truncate(old_len);
                    break;
                }
                Ok(Some(0)) => {
                    // peer closed
                    self.read_buf.truncate(old_len);
                    return StepOutcome::Close;
                }
                Ok(Some(n)) => {
                    self.read_buf.truncate(old_len + n);
                    if self.read_buf.len() > conf.max_request_size {
                        self.req.mark_bad();
                        break;
                    }
                }
                Err(_) => {
                    self.read_buf.truncate(old_len);
                    return StepOutcome::Close;
                }
            }
        }

        self.parsed += self.req.parse(&self.read_buf, self.parsed);

        if self.req.is_complete() {
            StepOutcome::AwaitWrite
        } else {
            StepOutcome::AwaitRead
        }
    }

    /// Build the response on first entry, then drive the two-phase send.
    fn on_writable(
        &mut self,
        router: &Router,
        conf: &ServerConf,
        metrics: &EngineMetrics,
    ) -> StepOutcome {
        if self.send.is_none() {
            if !self.req.is_complete() {
                // writable fired before a full request; keep reading
                return StepOutcome::AwaitRead;
            }
            self.build_response(router, conf);
            metrics.inc_req();
        }

        let fd = self.sock.raw();
        let st = match self.send.as_mut() {
            Some(st) => st,
            None => return StepOutcome::Close,
        };

        let file_fd = match &st.body {
            SendBody::File { fd: file, .. } => Some(file.raw()),
            _ => None,
        };
        let pumped = if let Some(file_fd) = file_fd {
            st.pump_file(
                |buf| {
                    let r = syscalls::write_nonblocking(fd, buf);
                    if let Ok(Some(n)) = r {
                        metrics.add_bytes(n as u64);
                    }
                    r
                },
                |offset, remaining| {
                    let mut off = offset as i64;
                    let r = syscalls::sendfile_chunk(fd, file_fd, &mut off, remaining);
                    if let Ok(Some(n)) = r {
                        metrics.add_bytes(n as u64);
                    }
                    r
                },
            )
        } else {
            st.pump_memory(|bufs| {
                let r = syscalls::writev_nonblocking(fd, bufs);
                if let Ok(Some(n)) = r {
                    metrics.add_bytes(n as u64);
                }
                r
            })
        };

        match pumped {
            Err(_) => StepOutcome::Close,
            Ok(false) => StepOutcome::AwaitWrite,
            Ok(true) => {
                debug_assert!(st.finished());
                let keep = st.keep_alive;
                // releases any open file handle before the next cycle
                self.send = None;
                if keep {
                    self.reset_for_next();
                    StepOutcome::AwaitRead
                } else {
                    StepOutcome::Close
                }
            }
        }
    }

    fn build_response(&mut self, router: &Router, conf: &ServerConf) {
        let mut rsp = router.dispatch(&self.req);

        let mut keep_alive = matches!(
            self.req.header("connection"),
            Some(v) if v.eq_ignore_ascii_case("keep-alive")
        );
        if self.served + 1 >= conf.max_keepalive_requests {
            keep_alive = false;
        }

        // Resolve the body source. A file body may degrade into an error
        // response (404/301/403/500) whose own body is then resolved on the
        // next pass; the attempt cap keeps a misbehaving error handler from
        // cycling forever.
        let mut resolved = None;
        for _ in 0..3 {
            match std::mem::replace(&mut rsp.body, Body::Empty) {
                Body::Empty => {
                    resolved = Some((SendBody::Empty, 0));
                    break;
                }
                Body::Bytes(b) => {
                    let len = b.len() as u64;
                    resolved = Some((SendBody::Bytes(b), len));
                    break;
                }
                Body::File(rel) => match open_file_body(&conf.doc_root, &rel) {
                    Ok((fd, len)) => {
                        resolved = Some((SendBody::File { fd, len }, len));
                        break;
                    }
                    Err(status) => {
                        rsp = router.error_response(status, &self.req);
                    }
                },
            }
        }
        let (body, content_length) = resolved.unwrap_or((SendBody::Empty, 0));

        let head = http::serialize_head(&rsp, content_length, keep_alive);
        self.send = Some(SendState::new(head, body, keep_alive));
    }

    /// Clear buffers and parser state for the next keep-alive exchange.
    fn reset_for_next(&mut self) {
        self.read_buf.clear();
        self.parsed = 0;
        self.req.reset();
        self.served += 1;
    }
}

/// Open a static resource and size it. Maps failures to the status code
/// the caller should answer with: a directory becomes a redirect, a
/// missing file 404, anything else 500.
fn open_file_body(doc_root: &str, rel_path: &str) -> Result<(FdGuard, u64), u16> {
    let path = match files::resolve_path(doc_root, rel_path) {
        Some(p) => p,
        None => return Err(403),
    };

    let cpath = match CString::new(path.as_os_str().as_bytes()) {
        Ok(c) => c,
        Err(_) => return Err(400),
    };

    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        return if err.raw_os_error() == Some(libc::ENOENT) {
            Err(404)
        } else {
            tracing::error!("open {:?} failed: {}", path, err);
            Err(500)
        };
    }
    let guard = FdGuard::new(fd);

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(guard.raw(), &mut stat) } < 0 {
        tracing::error!("fstat {:?} failed: {}", path, std::io::Error::last_os_error());
        return Err(500);
    }

    if (stat.st_mode & libc::S_IFMT) == libc::S_IFDIR {
        // guard drops here, so the directory fd is released before the
        // redirect response is built
        return Err(301);
    }

    Ok((guard, stat.st_size as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_memory_body(head: &[u8], body: &[u8]) -> SendState {
        SendState::new(
            head.to_vec(),
            SendBody::Bytes(body.to_vec()),
            false,
        )
    }

    /// Accept at most `budget` bytes into `out`, then report would-block.
    /// Models one writable event with a nearly-full socket buffer.
    fn throttled_accept(
        budget: &mut usize,
        out: &mut Vec<u8>,
        bufs: &[&[u8]],
    ) -> EngineResult<Option<usize>> {
        if *budget == 0 {
            return Ok(None);
        }
        let mut total = 0;
        for buf in bufs {
            let n = buf.len().min(*budget);
            out.extend_from_slice(&buf[..n]);
            total += n;
            *budget -= n;
            if *budget == 0 {
                break;
            }
        }
        if total == 0 { Ok(None) } else { Ok(Some(total)) }
    }

    #[test]
    fn partial_writes_resume_without_resending() {
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 26\r\n\r\n";
        let body = b"abcdefghijklmnopqrstuvwxyz";

        // reference: one uninterrupted send
        let mut reference = state_with_memory_body(head, body);
        let mut full = Vec::new();
        let mut unlimited = usize::MAX;
        assert!(
            reference
                .pump_memory(|b| throttled_accept(&mut unlimited, &mut full, b))
                .unwrap()
        );

        // throttled: the socket accepts 7 bytes per writable event
        let mut st = state_with_memory_body(head, body);
        let mut written = Vec::new();
        let mut rounds = 0;
        loop {
            let mut budget = 7;
            let done = st
                .pump_memory(|b| throttled_accept(&mut budget, &mut written, b))
                .unwrap();
            rounds += 1;
            if done {
                break;
            }
            assert!(rounds < 100, "send never completed");
        }

        assert_eq!(written, full);
        assert!(rounds > 1, "throttle did not split the send");
    }

    #[test]
    fn scatter_write_spans_head_and_body() {
        let mut st = state_with_memory_body(b"HEAD", b"BODY");
        let mut written = Vec::new();

        // first event takes all of the head and part of the body
        let mut budget = 6;
        let done = st
            .pump_memory(|b| throttled_accept(&mut budget, &mut written, b))
            .unwrap();
        assert!(!done);
        assert!(st.head_done);
        assert_eq!(st.body_sent, 2);

        let mut budget = 6;
        let done = st
            .pump_memory(|b| throttled_accept(&mut budget, &mut written, b))
            .unwrap();
        assert!(done);
        assert_eq!(written, b"HEADBODY");
    }

    #[test]
    fn file_send_respects_phase_order_and_offsets() {
        let mut st = SendState::new(
            b"HEAD".to_vec(),
            SendBody::File {
                fd: FdGuard::new(-1),
                len: 100,
            },
            true,
        );

        let mut head_writes = Vec::new();
        let mut chunks: Vec<(u64, u64)> = Vec::new();

        let done = st
            .pump_file(
                |buf| {
                    head_writes.extend_from_slice(buf);
                    Ok(Some(buf.len()))
                },
                |offset, remaining| {
                    chunks.push((offset, remaining));
                    // move 40 bytes per chunk, then stall once
                    if chunks.len() == 2 {
                        Ok(None)
                    } else {
                        Ok(Some(40.min(remaining as usize)))
                    }
                },
            )
            .unwrap();
        assert!(!done);
        assert_eq!(head_writes, b"HEAD");
        assert_eq!(st.body_sent, 40);

        // resume after the stall: offsets continue where the kernel stopped
        chunks.clear();
        let done = st
            .pump_file(
                |_| panic!("head must not be resent"),
                |offset, remaining| {
                    chunks.push((offset, remaining));
                    Ok(Some(remaining.min(40) as usize))
                },
            )
            .unwrap();
        assert!(done);
        assert_eq!(chunks.first().copied(), Some((40, 60)));
        assert_eq!(st.body_sent, 100);
    }

    #[test]
    fn empty_body_finishes_after_head() {
        let mut st = SendState::new(b"HEAD".to_vec(), SendBody::Empty, false);
        let mut written = Vec::new();
        let mut budget = usize::MAX;
        assert!(
            st.pump_memory(|b| throttled_accept(&mut budget, &mut written, b))
                .unwrap()
        );
        assert_eq!(written, b"HEAD");
    }
}
