//! Runtime options for servers, clients and single calls.
//!
//! Both option sets deserialize from camelCase JSON with every field optional,
//! so a deployment file only has to name what it changes.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerOptions {
    /// Answer with `SERVER_TIMEOUT` when a handler has not returned in time.
    /// `None` disables the timer.
    pub api_timeout_ms: Option<u64>,
    /// Expose fault detail to callers in `innerErr`. Off in production.
    pub return_inner_error: bool,
    pub log_req_body: bool,
    pub log_res_body: bool,
    pub log_msg_body: bool,
    /// Install the process-wide fault hook on start.
    pub capture_faults: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            api_timeout_ms: None,
            return_inner_error: false,
            log_req_body: true,
            log_res_body: true,
            log_msg_body: false,
            capture_faults: true,
        }
    }
}

impl ServerOptions {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn api_timeout(&self) -> Option<Duration> {
        self.api_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_return_inner_error(mut self, enabled: bool) -> Self {
        self.return_inner_error = enabled;
        self
    }

    /// Sets which bodies appear in the `[ApiReq]`, `[ApiRes]` and message log lines.
    pub fn with_body_logging(mut self, req: bool, res: bool, msg: bool) -> Self {
        self.log_req_body = req;
        self.log_res_body = res;
        self.log_msg_body = msg;
        self
    }

    pub fn with_capture_faults(mut self, enabled: bool) -> Self {
        self.capture_faults = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    /// Default per-call timeout; `None` waits forever.
    pub timeout_ms: Option<u64>,
    /// Sequence numbers run from `sn_min` to `sn_max` and then wrap.
    pub sn_min: u64,
    pub sn_max: u64,
    pub log_api: bool,
    pub log_msg: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { timeout_ms: Some(15_000), sn_min: 1, sn_max: u32::MAX as u64, log_api: true, log_msg: true }
    }
}

impl ClientOptions {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_sn_range(mut self, min: u64, max: u64) -> Self {
        self.sn_min = min;
        self.sn_max = max.max(min);
        self
    }
}

/// Per-call overrides.
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Replaces [`ClientOptions::timeout_ms`] for this call.
    pub timeout: Option<Duration>,
    /// Groups calls so [`crate::Client::abort_by_key`] can cancel them together.
    pub abort_key: Option<String>,
    /// Runs once if the call is aborted.
    pub on_abort: Option<std::sync::Arc<dyn Fn(u64) + Send + Sync>>,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn abort_key(mut self, key: impl Into<String>) -> Self {
        self.abort_key = Some(key.into());
        self
    }

    pub fn on_abort<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_abort = Some(std::sync::Arc::new(f));
        self
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("timeout", &self.timeout)
            .field("abort_key", &self.abort_key)
            .field("on_abort", &self.on_abort.is_some())
            .finish()
    }
}
