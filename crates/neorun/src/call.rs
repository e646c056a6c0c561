//! # Inbound Calls
//!
//! [`ApiCall`] is one in-flight request on the server. It carries the decoded
//! request and is the only way a handler answers.
//!
//! ## Invariants
//! - **Exactly Once**: the first of `succ` / `error` claims the call; every
//!   later attempt is logged and dropped, whoever makes it (handler, timeout
//!   timer, fault path).
//! - **Atomic Claim**: the claim is a single compare-and-swap taken before any
//!   await, so two racing returns can never both pass it.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use neorpc::Outcome;
use neorpc::RpcError;
use neorpc::ServiceDef;
use neorpc::code;
use serde_json::Value;

use crate::connection::Connection;
use crate::connection::ConnectionKind;
use crate::flows::ApiReturnData;

pub struct ApiCall {
    service: Arc<ServiceDef>,
    sn: u64,
    req: Value,
    conn: Arc<Connection>,
    started: Instant,
    claimed: AtomicBool,
    ret: OnceLock<Outcome>,
    used: OnceLock<Duration>,
}

impl ApiCall {
    pub(crate) fn new(service: Arc<ServiceDef>, sn: u64, req: Value, conn: Arc<Connection>) -> Self {
        Self {
            service,
            sn,
            req,
            conn,
            started: Instant::now(),
            claimed: AtomicBool::new(false),
            ret: OnceLock::new(),
            used: OnceLock::new(),
        }
    }

    pub fn service(&self) -> &Arc<ServiceDef> {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    pub fn sn(&self) -> u64 {
        self.sn
    }

    pub fn req(&self) -> &Value {
        &self.req
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// True once a return has been claimed, even if it is still being sent.
    pub fn is_returned(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// The outcome that went out, after `pre_api_return` had its say.
    pub fn ret(&self) -> Option<&Outcome> {
        self.ret.get()
    }

    /// Time from decode to return.
    pub fn used(&self) -> Option<Duration> {
        self.used.get().copied()
    }

    pub async fn succ(self: &Arc<Self>, res: Value) {
        self.prepare_return(Ok(res)).await
    }

    pub async fn error(self: &Arc<Self>, err: RpcError) {
        self.prepare_return(Err(err)).await
    }

    async fn prepare_return(self: &Arc<Self>, ret: Outcome) {
        if self.claimed.swap(true, Ordering::AcqRel) {
            tracing::warn!(conn = %self.conn.id(), sn = self.sn, api = %self.service.name, "api already returned; ignoring");
            return;
        }

        let shared = &self.conn.shared;
        let ret = match shared.flows.pre_api_return.exec(ApiReturnData { call: self.clone(), ret }).await {
            Ok(Some(data)) => data.ret,
            Ok(None) => {
                tracing::debug!(conn = %self.conn.id(), sn = self.sn, "return suppressed by pre_api_return");
                if self.conn.kind() == ConnectionKind::Short {
                    self.conn.close(None).await;
                }
                return;
            }
            Err(e) => {
                tracing::error!(conn = %self.conn.id(), sn = self.sn, api = %self.service.name, "{:#}", e);
                Err(internal_error(shared.options.return_inner_error, format!("{:#}", e)))
            }
        };

        let used = self.started.elapsed();
        let _ = self.used.set(used);
        self.log_return(&ret, used);
        let _ = self.ret.set(ret.clone());

        self.send_return(&ret).await;

        if let Err(e) = shared.flows.post_api_return.exec(ApiReturnData { call: self.clone(), ret }).await {
            tracing::error!(conn = %self.conn.id(), sn = self.sn, "post_api_return failed: {:#}", e);
        }
    }

    async fn send_return(self: &Arc<Self>, ret: &Outcome) {
        let shared = &self.conn.shared;
        let data = match shared.codec.encode_response(&self.service, self.sn, ret) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::error!(conn = %self.conn.id(), sn = self.sn, api = %self.service.name, "invalid response: {}", e);
                let mut fallback = RpcError::server("Internal Server Error").with_code(code::RES_DATA_ERR);
                if shared.options.return_inner_error {
                    fallback = fallback.with_inner(e.to_string());
                }
                shared
                    .codec
                    .encode_response(&self.service, self.sn, &Err(fallback))
                    .inspect_err(|e| tracing::error!(sn = self.sn, "cannot encode fallback error: {}", e))
                    .ok()
            }
        };

        if let Some(data) = data {
            if let Err(e) = self.conn.send(data, Some(self.sn)).await {
                tracing::debug!(conn = %self.conn.id(), sn = self.sn, "response not delivered: {}", e);
            }
        }

        if self.conn.kind() == ConnectionKind::Short {
            self.conn.close(None).await;
        }
    }

    fn log_return(&self, ret: &Outcome, used: Duration) {
        let conn = self.conn.id();
        let used_ms = used.as_millis() as u64;
        let api = &self.service.name;
        match ret {
            Ok(res) if self.conn.shared.options.log_res_body => {
                tracing::info!(conn = %conn, sn = self.sn, api = %api, used_ms, res = %res, "[ApiRes]")
            }
            Ok(_) => tracing::info!(conn = %conn, sn = self.sn, api = %api, used_ms, "[ApiRes]"),
            Err(err) if err.is_business() => {
                tracing::info!(conn = %conn, sn = self.sn, api = %api, used_ms, err = %err, "[ApiErr]")
            }
            Err(err) => tracing::error!(conn = %conn, sn = self.sn, api = %api, used_ms, err = %err, "[ApiErr]"),
        }
    }
}

impl fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCall")
            .field("api", &self.service.name)
            .field("sn", &self.sn)
            .field("conn", &self.conn.id())
            .field("returned", &self.is_returned())
            .finish()
    }
}

/// One inbound message, as seen by message listeners.
#[derive(Debug)]
pub struct MsgCall {
    service: Arc<ServiceDef>,
    msg: Value,
    conn: Arc<Connection>,
}

impl MsgCall {
    pub(crate) fn new(service: Arc<ServiceDef>, msg: Value, conn: Arc<Connection>) -> Self {
        Self { service, msg, conn }
    }

    pub fn service(&self) -> &Arc<ServiceDef> {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    pub fn msg(&self) -> &Value {
        &self.msg
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }
}

/// The error a caller sees for a fault that is not a deliberate [`RpcError`].
pub(crate) fn internal_error(return_inner: bool, detail: impl fmt::Display) -> RpcError {
    let err = RpcError::server("Internal Server Error");
    if return_inner { err.with_inner(detail.to_string()) } else { err }
}
