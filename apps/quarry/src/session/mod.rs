//! Lifecycle of every client connection: admission, pending-session
//! bookkeeping, per-session FIFO dispatch, rate limiting, idle reclamation,
//! and shutdown, for both the streamable and the legacy event-stream
//! transport.

pub mod queue;
pub mod rate_limit;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{CredentialResolver, SessionAuth};
use crate::capacity::{admitted, HealthSnapshot};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::mcp::registry::ToolRegistry;
use crate::mcp::McpService;
use crate::session::queue::{AuthSlot, RequestQueue, SessionStats};
use crate::session::rate_limit::RateWindow;
use forge_api::ForgeClient;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session capacity reached; retry later")]
    CapacityExceeded,
    #[error("unknown session id '{0}'")]
    UnknownSession(String),
    #[error("server not initialized: send an initialize request first")]
    NotInitialized,
    #[error("session request rate limit exceeded; back off until the next window")]
    RateLimited,
    #[error("session closed while the request was in flight")]
    Closed,
    #[error("session handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Streamable,
    EventStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    TransportError,
    IdleTimeout,
    Shutdown,
    Explicit,
    HandshakeFailed,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub rate_window: Duration,
    pub rate_ceiling: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            idle_timeout: Duration::from_secs(300),
            rate_window: Duration::from_secs(60),
            rate_ceiling: 120,
        }
    }
}

type CreatedHook = Arc<dyn Fn(&str, TransportKind) + Send + Sync>;
type ClosedHook = Arc<dyn Fn(&str, CloseReason) + Send + Sync>;

/// Observation points for operational tooling; invoked inline, so hooks must
/// not block.
#[derive(Clone, Default)]
pub struct SessionHooks {
    pub on_created: Option<CreatedHook>,
    pub on_closed: Option<ClosedHook>,
}

struct StreamableSession {
    id: String,
    stats: Arc<SessionStats>,
    queue: RequestQueue,
    auth: Arc<AuthSlot>,
    rate: StdMutex<RateWindow>,
    closed: AtomicBool,
}

pub struct EventStreamSession {
    id: String,
    stats: Arc<SessionStats>,
    service: Arc<McpService>,
    outbound: mpsc::UnboundedSender<JsonRpcResponse>,
    auth: Arc<AuthSlot>,
    closed: AtomicBool,
}

impl EventStreamSession {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Result of opening a streamable session. `session_id` is `None` when the
/// handshake produced a protocol error before any identity was assigned; the
/// response still travels back to the client, but nothing was allocated.
#[derive(Debug)]
pub struct StreamableOpen {
    pub session_id: Option<String>,
    pub response: JsonRpcResponse,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    registry: Arc<ToolRegistry>,
    forge: Arc<ForgeClient>,
    resolver: Arc<CredentialResolver>,
    default_auth: SessionAuth,
    streamable: RwLock<HashMap<String, Arc<StreamableSession>>>,
    pending: RwLock<HashSet<Uuid>>,
    event_streams: RwLock<HashMap<String, Arc<EventStreamSession>>>,
    hooks: SessionHooks,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        registry: Arc<ToolRegistry>,
        forge: Arc<ForgeClient>,
        resolver: Arc<CredentialResolver>,
    ) -> Self {
        Self::with_hooks(config, registry, forge, resolver, SessionHooks::default())
    }

    pub fn with_hooks(
        config: ManagerConfig,
        registry: Arc<ToolRegistry>,
        forge: Arc<ForgeClient>,
        resolver: Arc<CredentialResolver>,
        hooks: SessionHooks,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                forge,
                resolver,
                default_auth: SessionAuth::empty(),
                streamable: RwLock::new(HashMap::new()),
                pending: RwLock::new(HashSet::new()),
                event_streams: RwLock::new(HashMap::new()),
                hooks,
            }),
        }
    }

    /// Admit and open a streamable session. Only an `initialize` request may
    /// create one; the under-construction pair is tracked in the pending set
    /// (counted against capacity, invisible to lookup) until the handshake
    /// assigns an id.
    pub async fn open_streamable(
        &self,
        request: JsonRpcRequest,
        observed_auth: Option<SessionAuth>,
    ) -> Result<StreamableOpen, SessionError> {
        if !request.is_initialize() {
            return Err(SessionError::NotInitialized);
        }

        let pending_token = self.admit(TransportKind::Streamable).await?;

        let service = Arc::new(McpService::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.forge),
            Arc::clone(&self.inner.resolver),
        ));
        let handshake_auth = observed_auth
            .clone()
            .unwrap_or_else(|| self.inner.default_auth.clone());
        let response = match service.handle(request, &handshake_auth).await {
            Some(response) => response,
            None => {
                // initialize always carries an id; a missing response means
                // the request was malformed enough to be treated as a
                // notification. No id was ever assigned: tear down silently.
                self.remove_pending(pending_token).await;
                return Err(SessionError::Handshake(
                    "initialize request produced no response".to_string(),
                ));
            }
        };

        if response.is_error() {
            // Failed before an id existed: destroy the pending entry and let
            // only the protocol-level error reach the caller.
            self.remove_pending(pending_token).await;
            debug!(target: "quarry::session", "handshake rejected; pending session destroyed");
            return Ok(StreamableOpen {
                session_id: None,
                response,
            });
        }

        let session_id = Uuid::new_v4().to_string();
        let stats = Arc::new(SessionStats::new());
        let auth = Arc::new(AuthSlot::new());
        if let Some(observed) = observed_auth {
            auth.observe(observed);
        }
        let queue = RequestQueue::spawn(
            Arc::clone(&service),
            Arc::clone(&stats),
            Arc::clone(&auth),
            self.inner.default_auth.clone(),
        );
        let session = Arc::new(StreamableSession {
            id: session_id.clone(),
            stats,
            queue,
            auth,
            rate: StdMutex::new(RateWindow::new(
                self.inner.config.rate_window,
                self.inner.config.rate_ceiling,
            )),
            closed: AtomicBool::new(false),
        });

        {
            // Move out of the pending set and into the table in one step so
            // the session is never double-counted against capacity.
            let mut table = self.inner.streamable.write().await;
            if table.contains_key(&session_id) {
                // The session already had an identity when this failed, so it
                // must not be left dangling: close it and surface the error.
                drop(table);
                self.remove_pending(pending_token).await;
                session.closed.store(true, Ordering::SeqCst);
                session.queue.close();
                return Err(SessionError::Handshake(format!(
                    "session id collision for '{session_id}'"
                )));
            }
            table.insert(session_id.clone(), session);
            self.inner.pending.write().await.remove(&pending_token);
        }

        info!(target: "quarry::session", session = %session_id, "streamable session opened");
        if let Some(hook) = &self.inner.hooks.on_created {
            hook(&session_id, TransportKind::Streamable);
        }

        Ok(StreamableOpen {
            session_id: Some(session_id),
            response,
        })
    }

    /// Queue one request on an existing streamable session and wait for its
    /// turn. Rate-limit rejections happen here, before anything is queued.
    pub async fn dispatch(
        &self,
        session_id: &str,
        request: JsonRpcRequest,
        observed_auth: Option<SessionAuth>,
    ) -> Result<Option<JsonRpcResponse>, SessionError> {
        let session = {
            let table = self.inner.streamable.read().await;
            table
                .get(session_id)
                .cloned()
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?
        };
        if session.closed.load(Ordering::SeqCst) {
            return Err(SessionError::UnknownSession(session_id.to_string()));
        }

        session.stats.touch();
        if let Some(observed) = observed_auth {
            if observed.has_credentials() {
                session.auth.observe(observed);
            }
        }

        {
            let mut rate = session.rate.lock().unwrap();
            if !rate.allow(Instant::now()) {
                return Err(SessionError::RateLimited);
            }
        }

        let receiver = session.queue.submit(request).ok_or(SessionError::Closed)?;
        receiver.await.map_err(|_| SessionError::Closed)
    }

    pub async fn close_streamable(&self, session_id: &str, reason: CloseReason) -> bool {
        let removed = {
            let mut table = self.inner.streamable.write().await;
            table.remove(session_id)
        };
        let Some(session) = removed else {
            return false;
        };
        session.closed.store(true, Ordering::SeqCst);
        session.queue.close();
        info!(target: "quarry::session", session = %session_id, ?reason, "streamable session closed");
        if let Some(hook) = &self.inner.hooks.on_closed {
            hook(&session.id, reason);
        }
        true
    }

    /// Admit and open an event-stream session. The legacy transport assigns
    /// the id itself, so the session is addressable immediately.
    pub async fn open_event_stream(
        &self,
        observed_auth: Option<SessionAuth>,
    ) -> Result<(Arc<EventStreamSession>, mpsc::UnboundedReceiver<JsonRpcResponse>), SessionError>
    {
        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let auth = Arc::new(AuthSlot::new());
        if let Some(observed) = observed_auth {
            auth.observe(observed);
        }
        let session = Arc::new(EventStreamSession {
            id: session_id.clone(),
            stats: Arc::new(SessionStats::new()),
            service: Arc::new(McpService::new(
                Arc::clone(&self.inner.registry),
                Arc::clone(&self.inner.forge),
                Arc::clone(&self.inner.resolver),
            )),
            outbound: tx,
            auth,
            closed: AtomicBool::new(false),
        });

        {
            // Check-and-insert under the table's write lock so a burst of
            // connections cannot slip past the capacity ceiling together.
            let mut table = self.inner.event_streams.write().await;
            let streamable = self.inner.streamable.read().await.len();
            let pending = self.inner.pending.read().await.len();
            if !admitted(
                streamable,
                pending,
                table.len(),
                self.inner.config.max_sessions,
            ) {
                warn!(target: "quarry::session", "admission rejected: capacity reached");
                return Err(SessionError::CapacityExceeded);
            }
            table.insert(session_id.clone(), Arc::clone(&session));
        }

        info!(target: "quarry::session", session = %session_id, "event-stream session opened");
        if let Some(hook) = &self.inner.hooks.on_created {
            hook(&session_id, TransportKind::EventStream);
        }
        Ok((session, rx))
    }

    /// Handle one request for an event-stream session. The legacy transport
    /// is push-oriented: the response (if any) travels over the paired
    /// stream, not back to this caller.
    pub async fn dispatch_event_stream(
        &self,
        session_id: &str,
        request: JsonRpcRequest,
        observed_auth: Option<SessionAuth>,
    ) -> Result<(), SessionError> {
        let session = {
            let table = self.inner.event_streams.read().await;
            table
                .get(session_id)
                .cloned()
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?
        };
        if session.closed.load(Ordering::SeqCst) {
            return Err(SessionError::UnknownSession(session_id.to_string()));
        }

        if let Some(observed) = observed_auth {
            if observed.has_credentials() {
                session.auth.observe(observed);
            }
        }
        let effective = session
            .auth
            .current()
            .unwrap_or_else(|| self.inner.default_auth.clone());

        session.stats.begin_request();
        let response = session.service.handle(request, &effective).await;
        session.stats.end_request();

        if let Some(response) = response {
            if session.outbound.send(response).is_err() {
                // The stream side is gone; treat it as a client disconnect.
                self.close_event_stream(session_id, CloseReason::ClientDisconnect)
                    .await;
                return Err(SessionError::Closed);
            }
        }
        Ok(())
    }

    pub async fn close_event_stream(&self, session_id: &str, reason: CloseReason) -> bool {
        let removed = {
            let mut table = self.inner.event_streams.write().await;
            table.remove(session_id)
        };
        let Some(session) = removed else {
            return false;
        };
        session.closed.store(true, Ordering::SeqCst);
        info!(target: "quarry::session", session = %session_id, ?reason, "event-stream session closed");
        if let Some(hook) = &self.inner.hooks.on_closed {
            hook(&session.id, reason);
        }
        true
    }

    /// One idle sweep pass. Sessions with in-flight work are never closed,
    /// regardless of age.
    pub async fn sweep_idle(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let timeout_secs = self.inner.config.idle_timeout.as_secs();

        let stale_streamable: Vec<String> = {
            let table = self.inner.streamable.read().await;
            table
                .values()
                .filter(|s| s.stats.in_flight() == 0 && s.stats.idle_for_secs(now) >= timeout_secs)
                .map(|s| s.id.clone())
                .collect()
        };
        let stale_event_streams: Vec<String> = {
            let table = self.inner.event_streams.read().await;
            table
                .values()
                .filter(|s| s.stats.in_flight() == 0 && s.stats.idle_for_secs(now) >= timeout_secs)
                .map(|s| s.id.clone())
                .collect()
        };

        let mut closed = 0;
        for id in stale_streamable {
            if self.close_streamable(&id, CloseReason::IdleTimeout).await {
                closed += 1;
            }
        }
        for id in stale_event_streams {
            if self.close_event_stream(&id, CloseReason::IdleTimeout).await {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(target: "quarry::session", closed, "idle sweep reclaimed sessions");
        }
        closed
    }

    /// Close every tracked session of both kinds concurrently. Individual
    /// close failures are logged by the close paths and never abort the
    /// shutdown.
    pub async fn shutdown(&self) {
        let streamable_ids: Vec<String> = {
            let table = self.inner.streamable.read().await;
            table.keys().cloned().collect()
        };
        let event_stream_ids: Vec<String> = {
            let table = self.inner.event_streams.read().await;
            table.keys().cloned().collect()
        };

        let streamable_closes = streamable_ids
            .into_iter()
            .map(|id| {
                let manager = self.clone();
                async move {
                    manager.close_streamable(&id, CloseReason::Shutdown).await;
                }
            })
            .collect::<Vec<_>>();
        let event_stream_closes = event_stream_ids
            .into_iter()
            .map(|id| {
                let manager = self.clone();
                async move {
                    manager
                        .close_event_stream(&id, CloseReason::Shutdown)
                        .await;
                }
            })
            .collect::<Vec<_>>();

        futures::future::join_all(streamable_closes).await;
        futures::future::join_all(event_stream_closes).await;
        info!(target: "quarry::session", "session manager shut down");
    }

    /// Read-only pool counts for the health endpoint.
    pub async fn health(&self) -> HealthSnapshot {
        let streamable = self.inner.streamable.read().await.len();
        let pending = self.inner.pending.read().await.len();
        let event_streams = self.inner.event_streams.read().await.len();
        HealthSnapshot::new(
            streamable,
            pending,
            event_streams,
            self.inner.config.max_sessions,
        )
    }

    async fn admit(&self, kind: TransportKind) -> Result<Uuid, SessionError> {
        let streamable = self.inner.streamable.read().await.len();
        let event_streams = self.inner.event_streams.read().await.len();
        let mut pending = self.inner.pending.write().await;
        if !admitted(
            streamable,
            pending.len(),
            event_streams,
            self.inner.config.max_sessions,
        ) {
            warn!(target: "quarry::session", ?kind, "admission rejected: capacity reached");
            return Err(SessionError::CapacityExceeded);
        }
        let token = Uuid::new_v4();
        pending.insert(token);
        Ok(token)
    }

    async fn remove_pending(&self, token: Uuid) {
        self.inner.pending.write().await.remove(&token);
    }
}
