// src/config.rs
use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Engine configuration. All fields have working defaults; the builder
/// methods cover the knobs most deployments touch.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConf {
    pub host: String,
    pub port: u16,
    /// Document root for the static-file fallback.
    pub doc_root: String,
    /// Number of reactor (event loop) threads.
    pub reactors: usize,
    /// Listen backlog (completed-connection queue).
    pub backlog: i32,
    /// Bytes requested per read syscall; the read buffer grows in these steps.
    pub read_chunk_size: usize,
    /// Requests larger than this are answered with 400.
    pub max_request_size: usize,
    /// Edge-triggered listener registration.
    pub edge_trigger_listener: bool,
    /// Edge-triggered connection registration (one-shot either way).
    pub edge_trigger_conns: bool,
    /// Events harvested per multiplexer wait.
    pub max_events: usize,
    /// Idle window before a connection is reaped.
    pub idle_timeout_ms: u64,
    /// Multiplexer wait timeout; also the sweep and shutdown-poll cadence.
    pub wait_timeout_ms: i32,
    /// Exchanges served on one connection before keep-alive is refused.
    pub max_keepalive_requests: u32,
    pub pool_min_workers: usize,
    pub pool_max_workers: usize,
    /// Enable the sizing manager thread.
    pub pool_dynamic: bool,
    pub pool_manager_interval_ms: u64,
    /// Queue length above which a sample counts as busy.
    pub pool_busy_threshold: usize,
    /// Queue length below which a sample counts as idle.
    pub pool_idle_threshold: usize,
    /// Consecutive samples needed before the pool is resized.
    pub pool_status_times: u32,
    /// Workers added or retired per adjustment.
    pub pool_adjust_step: usize,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: ".".to_string(),
            reactors: num_cpus::get(),
            backlog: 1024,
            read_chunk_size: 2048,
            max_request_size: 1 << 20,
            edge_trigger_listener: false,
            edge_trigger_conns: false,
            max_events: 4096,
            idle_timeout_ms: 10_000,
            wait_timeout_ms: 1000,
            max_keepalive_requests: 10_000,
            pool_min_workers: 4,
            pool_max_workers: 16,
            pool_dynamic: true,
            pool_manager_interval_ms: 10_000,
            pool_busy_threshold: 100,
            pool_idle_threshold: 10,
            pool_status_times: 3,
            pool_adjust_step: 1,
        }
    }
}

impl ServerConf {
    pub fn new(port: u16, doc_root: impl Into<String>) -> Self {
        Self {
            port,
            doc_root: doc_root.into(),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn reactors(mut self, n: usize) -> Self {
        self.reactors = n;
        self
    }

    pub fn pool_workers(mut self, min: usize, max: usize) -> Self {
        self.pool_min_workers = min;
        self.pool_max_workers = max;
        self
    }

    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.reactors == 0 {
            return Err(EngineError::Config("reactors must be >= 1".into()));
        }
        if self.pool_min_workers == 0 {
            return Err(EngineError::Config("pool_min_workers must be >= 1".into()));
        }
        if self.pool_min_workers > self.pool_max_workers {
            return Err(EngineError::Config(
                "pool_min_workers must not exceed pool_max_workers".into(),
            ));
        }
        if self.read_chunk_size == 0 || self.max_events == 0 {
            return Err(EngineError::Config(
                "buffer and event sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ServerConf::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let conf = ServerConf::default().pool_workers(8, 2);
        assert!(conf.validate().is_err());
    }

    #[test]
    fn rejects_zero_reactors() {
        let conf = ServerConf::default().reactors(0);
        assert!(conf.validate().is_err());
    }
}
