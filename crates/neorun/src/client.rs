//! # Client Call Tracker
//!
//! Issues API calls over a transport and correlates the responses that come
//! back through [`Client::on_receive`] by sequence number.
//!
//! ## Invariants
//! - **Single Resolution**: a pending call is settled by whoever removes its
//!   entry from the pending table first: the response, the timeout or an
//!   abort. The losers find nothing to remove and do nothing.
//! - **Aborts Never Resolve**: an aborted call (by sn, by key, or by a
//!   `pre_call_api` node returning `None`) stays pending forever. Callers
//!   that abort are expected to have stopped awaiting it.
//! - **Dropped Calls Leave Nothing Behind**: dropping a `call_api` future
//!   removes its pending entry, even when no timeout is set.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use neorpc::Frame;
use neorpc::FrameCodec;
use neorpc::Outcome;
use neorpc::RpcError;
use neorpc::ServiceDef;
use neorpc::code;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::CallOptions;
use crate::config::ClientOptions;
use crate::fault::panic_message;
use crate::flows::CallApiData;
use crate::flows::ClientFlows;
use crate::flows::ClientMsgData;
use crate::flows::ReturnData;
use crate::listener::ListenerId;
use crate::listener::Listeners;
use crate::sn::SnCounter;
use crate::transport::Transport;

pub type MsgListener = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One outbound call waiting for its response.
struct PendingApi {
    /// Distinguishes this call from a later one that reuses its sn.
    id: u64,
    service: Arc<ServiceDef>,
    abort_key: Option<String>,
    on_abort: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    tx: oneshot::Sender<Outcome>,
}

/// Drops the pending entry if the caller stops awaiting before it settled.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingApi>,
    sn: u64,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove_if(&self.sn, |_, entry| entry.id == self.id);
    }
}

struct Inner {
    codec: Arc<dyn FrameCodec>,
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    flows: ClientFlows,
    pending: DashMap<u64, PendingApi>,
    next_id: AtomicU64,
    sn: SnCounter,
    listeners: Listeners<MsgListener>,
}

/// Cheap to clone; every clone shares the pending table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(codec: Arc<dyn FrameCodec>, transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        let sn = SnCounter::new(options.sn_min, options.sn_max);
        Self {
            inner: Arc::new(Inner {
                codec,
                transport,
                options,
                flows: ClientFlows::new(),
                pending: DashMap::new(),
                next_id: AtomicU64::new(0),
                sn,
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn flows(&self) -> &ClientFlows {
        &self.inner.flows
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Sequence numbers of the calls still waiting, in ascending order.
    pub fn pending_sns(&self) -> Vec<u64> {
        let mut sns: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        sns.sort_unstable();
        sns
    }

    pub async fn call_api(&self, name: &str, req: Value) -> Outcome {
        self.call_api_with(name, req, CallOptions::default()).await
    }

    pub async fn call_api_with(&self, name: &str, req: Value, options: CallOptions) -> Outcome {
        let inner = &self.inner;
        let Some(service) = inner.codec.registry().api(name).cloned() else {
            return Err(RpcError::client(format!("Invalid API name: {}", name)).with_code(code::INVALID_API));
        };

        let call = match inner.flows.pre_call_api.exec(CallApiData { service, req, options }).await {
            Ok(Some(call)) => call,
            Ok(None) => {
                tracing::debug!(api = name, "call aborted by pre_call_api");
                return std::future::pending().await;
            }
            Err(e) => return Err(RpcError::client(format!("{:#}", e)).with_code(code::FLOW_ERROR)),
        };
        let CallApiData { service, req, options } = call;

        let sn = inner.sn.next();
        let data = match inner.codec.encode_request(&service, sn, &req) {
            Ok(data) => data,
            Err(e) => return Err(RpcError::client(e.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = PendingApi {
            id,
            service: service.clone(),
            abort_key: options.abort_key.clone(),
            on_abort: options.on_abort.clone(),
            tx,
        };
        inner.pending.insert(sn, entry);
        let _guard = PendingGuard { pending: &inner.pending, sn, id };
        if inner.options.log_api {
            tracing::info!(sn, api = %service.name, "[ApiReq]");
        }

        let mut sent_err = None;
        if let Err(err) = self.send_data(data).await {
            if inner.pending.remove(&sn).is_some() {
                sent_err = Some(err);
            }
        }
        let received = match sent_err {
            Some(err) => Ok(Err(err)),
            None => self.wait(sn, rx, options.timeout.or(inner.options.timeout())).await,
        };
        let Ok(ret) = received else {
            tracing::debug!(sn, api = %service.name, "call aborted");
            return std::future::pending().await;
        };

        let data = match inner.flows.pre_api_return.exec(ReturnData { service, sn, req, ret }).await {
            Ok(Some(data)) => data,
            Ok(None) => return std::future::pending().await,
            Err(e) => return Err(RpcError::client(format!("{:#}", e)).with_code(code::FLOW_ERROR)),
        };

        if inner.options.log_api {
            match &data.ret {
                Ok(_) => tracing::info!(sn, api = %data.service.name, "[ApiRes]"),
                Err(err) if err.is_business() => tracing::info!(sn, api = %data.service.name, err = %err, "[ApiErr]"),
                Err(err) => tracing::error!(sn, api = %data.service.name, err = %err, "[ApiErr]"),
            }
        }

        let ret = data.ret.clone();
        if let Err(e) = inner.flows.post_api_return.exec(data).await {
            tracing::warn!(sn, "post_api_return failed: {:#}", e);
        }
        ret
    }

    /// Waits for the response to `sn`. `Err` means the entry was dropped
    /// without an outcome, which only an abort does.
    async fn wait(
        &self,
        sn: u64,
        mut rx: oneshot::Receiver<Outcome>,
        timeout: Option<Duration>,
    ) -> Result<Outcome, oneshot::error::RecvError> {
        let Some(limit) = timeout else {
            return rx.await;
        };
        tokio::select! {
            received = &mut rx => received,
            _ = tokio::time::sleep(limit) => {
                if self.inner.pending.remove(&sn).is_some() {
                    Ok(Err(RpcError::network("Request Timeout").with_code(code::TIMEOUT)))
                } else {
                    // Lost the race to a response or an abort.
                    rx.await
                }
            }
        }
    }

    /// Cancels one call. Returns `false` if it had already settled.
    pub fn abort(&self, sn: u64) -> bool {
        let Some((_, entry)) = self.inner.pending.remove(&sn) else {
            return false;
        };
        tracing::debug!(sn, api = %entry.service.name, "aborting call");
        if let Some(on_abort) = &entry.on_abort {
            on_abort(sn);
        }
        true
    }

    pub fn abort_by_key(&self, key: &str) -> usize {
        let sns: Vec<u64> = self
            .inner
            .pending
            .iter()
            .filter(|e| e.abort_key.as_deref() == Some(key))
            .map(|e| *e.key())
            .collect();
        sns.into_iter().filter(|sn| self.abort(*sn)).count()
    }

    pub fn abort_all(&self) -> usize {
        let sns: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        sns.into_iter().filter(|sn| self.abort(*sn)).count()
    }

    pub async fn send_msg(&self, name: &str, msg: Value) -> Result<(), RpcError> {
        let inner = &self.inner;
        let service = inner
            .codec
            .registry()
            .msg(name)
            .cloned()
            .ok_or_else(|| RpcError::client(format!("Invalid message name: {}", name)))?;

        let data = match inner.flows.pre_send_msg.exec(ClientMsgData { service, msg }).await {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(()),
            Err(e) => return Err(RpcError::client(format!("{:#}", e)).with_code(code::FLOW_ERROR)),
        };

        let frame = inner.codec.encode_message(&data.service, &data.msg).map_err(|e| RpcError::client(e.to_string()))?;
        self.send_data(frame).await?;
        if inner.options.log_msg {
            tracing::info!(msg = %data.service.name, "[SendMsg]");
        }

        if let Err(e) = inner.flows.post_send_msg.exec(data).await {
            tracing::warn!(msg = name, "post_send_msg failed: {:#}", e);
        }
        Ok(())
    }

    pub fn listen_msg<F, Fut>(&self, name: &str, handler: F) -> Result<ListenerId, RpcError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.codec.registry().msg(name).is_none() {
            return Err(RpcError::client(format!("Invalid message name: {}", name)));
        }
        let handler: MsgListener = Arc::new(move |msg| handler(msg).boxed());
        Ok(self.inner.listeners.add(name, handler))
    }

    pub fn unlisten_msg(&self, name: &str, id: ListenerId) -> bool {
        self.inner.listeners.remove(name, id)
    }

    pub fn unlisten_all(&self, name: &str) -> usize {
        self.inner.listeners.remove_all(name)
    }

    /// Entry point for bytes the transport received from the server.
    pub async fn on_receive(&self, data: Vec<u8>) {
        let inner = &self.inner;
        let data = match inner.flows.pre_recv_data.exec(data).await {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("pre_recv_data failed: {:#}", e);
                return;
            }
        };

        let frame = inner.codec.decode(&data);
        inner.codec.release(data);

        match frame {
            Ok(Frame::Response { sn, outcome, .. }) => self.settle(sn, outcome),
            Ok(Frame::Message { service, msg }) => {
                tokio::spawn(self.clone().dispatch_msg(service, msg));
            }
            Ok(Frame::Request { sn, .. }) => {
                tracing::warn!(sn, "unexpected request frame from server");
            }
            Err(err) => {
                tracing::warn!("invalid input: {}", err);
                if let Some(sn) = err.sn() {
                    let err = RpcError::client(format!("Invalid response: {}", err)).with_code(code::RES_DATA_ERR);
                    self.settle(sn, Err(err));
                }
            }
        }
    }

    fn settle(&self, sn: u64, outcome: Outcome) {
        match self.inner.pending.remove(&sn) {
            Some((_, entry)) => {
                let _ = entry.tx.send(outcome);
            }
            None => tracing::debug!(sn, "no pending call for response; dropped"),
        }
    }

    async fn dispatch_msg(self, service: Arc<ServiceDef>, msg: Value) {
        let data = match self.inner.flows.pre_recv_msg.exec(ClientMsgData { service, msg }).await {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("pre_recv_msg failed: {:#}", e);
                return;
            }
        };
        if self.inner.options.log_msg {
            tracing::info!(msg = %data.service.name, "[RecvMsg]");
        }

        let listeners = self.inner.listeners.snapshot(&data.service.name);
        let runs = listeners.into_iter().map(|listener| AssertUnwindSafe(listener(data.msg.clone())).catch_unwind());
        for result in futures::future::join_all(runs).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(msg = %data.service.name, "listener failed: {:#}", e),
                Err(panic) => {
                    tracing::error!(msg = %data.service.name, "listener panicked: {}", panic_message(panic.as_ref()))
                }
            }
        }
    }

    async fn send_data(&self, data: Vec<u8>) -> Result<(), RpcError> {
        let inner = &self.inner;
        let data = match inner.flows.pre_send_data.exec(data).await {
            Ok(Some(data)) => data,
            Ok(None) => return Ok(()),
            Err(e) => return Err(RpcError::client(format!("{:#}", e)).with_code(code::FLOW_ERROR)),
        };
        let sent = inner.transport.send(&data).await;
        inner.codec.release(data);
        sent.map_err(|e| RpcError::network(e.to_string()).with_code(code::SEND_DATA_ERR))
    }

    /// Closes the transport and fails every pending call with a network error.
    pub async fn disconnect(&self) {
        self.inner.transport.close(None).await;
        let sns: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for sn in sns {
            self.settle(sn, Err(RpcError::network("Connection closed")));
        }
        self.inner.sn.reset();
    }
}
