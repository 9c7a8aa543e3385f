use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::auth::SessionAuth;
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::mcp::McpService;

/// In-flight bookkeeping shared between a session record and its queue
/// worker, so idle detection can tell "connected but inactive" from
/// "mid-request".
#[derive(Debug)]
pub struct SessionStats {
    in_flight: AtomicUsize,
    last_access_unix: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        let stats = Self {
            in_flight: AtomicUsize::new(0),
            last_access_unix: AtomicU64::new(0),
        };
        stats.touch();
        stats
    }

    pub fn touch(&self) {
        let now = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;
        self.last_access_unix.store(now, Ordering::SeqCst);
    }

    pub fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_request(&self) {
        self.touch();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_for_secs(&self, now: OffsetDateTime) -> u64 {
        let last = self.last_access_unix.load(Ordering::SeqCst);
        (now.unix_timestamp().max(0) as u64).saturating_sub(last)
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the most recently observed per-request auth override for a session.
/// The queue worker reads it immediately before each dispatch, so a fresher
/// override observed while earlier work was queued still applies.
#[derive(Debug, Default)]
pub struct AuthSlot {
    latest: Mutex<Option<SessionAuth>>,
}

impl AuthSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, auth: SessionAuth) {
        *self.latest.lock().unwrap() = Some(auth);
    }

    pub fn current(&self) -> Option<SessionAuth> {
        self.latest.lock().unwrap().clone()
    }
}

struct QueuedCall {
    request: JsonRpcRequest,
    reply: oneshot::Sender<Option<JsonRpcResponse>>,
}

/// FIFO work queue for one session, drained by a single worker task.
///
/// The worker dispatches exactly one request at a time, in submission order,
/// resolving the effective auth (override, else default) right before each
/// dispatch and keeping it for that dispatch only. A dropped reply receiver
/// is swallowed so one abandoned call never stalls the chain behind it.
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueuedCall>,
    worker: JoinHandle<()>,
}

impl RequestQueue {
    pub fn spawn(
        service: Arc<McpService>,
        stats: Arc<SessionStats>,
        auth: Arc<AuthSlot>,
        default_auth: SessionAuth,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedCall>();
        let worker = tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                let effective = auth.current().unwrap_or_else(|| default_auth.clone());
                stats.begin_request();
                let response = service.handle(call.request, &effective).await;
                stats.end_request();
                let _ = call.reply.send(response);
            }
        });
        Self { tx, worker }
    }

    /// Queue one request. The returned receiver resolves once every prior
    /// request for this session has completed and this one has run. `None`
    /// means the worker is gone and the session is effectively closed.
    pub fn submit(
        &self,
        request: JsonRpcRequest,
    ) -> Option<oneshot::Receiver<Option<JsonRpcResponse>>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(QueuedCall { request, reply }).ok()?;
        Some(rx)
    }

    pub fn close(&self) {
        self.worker.abort();
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
