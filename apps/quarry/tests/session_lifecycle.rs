//! End-to-end lifecycle coverage for the session manager: admission,
//! ordering, rate limiting, idle reclamation, hooks, and shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use url::Url;

use forge_api::ForgeClient;
use quarry::auth::{CredentialResolver, ResolverConfig, SessionAuth};
use quarry::mcp::protocol::JsonRpcRequest;
use quarry::mcp::registry::{handler, RegisteredTool, ToolRegistry};
use quarry::session::{
    CloseReason, ManagerConfig, SessionError, SessionHooks, SessionManager, TransportKind,
};

type EventLog = Arc<Mutex<Vec<(u64, &'static str)>>>;

fn recording_registry(events: EventLog) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(RegisteredTool {
        name: "record",
        description: "records call order with a seq-dependent delay",
        input_schema: json!({"type": "object"}),
        handler: handler(move |_ctx, args| {
            let events = events.clone();
            async move {
                let seq = args["seq"].as_u64().unwrap_or(0);
                events.lock().unwrap().push((seq, "start"));
                // Later submissions sleep less, so overlap would reorder.
                let delay = 50u64.saturating_sub(seq * 10);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                events.lock().unwrap().push((seq, "end"));
                Ok(json!({ "seq": seq }))
            }
        }),
    });
    registry.register(RegisteredTool {
        name: "whoami",
        description: "echoes the token an outbound call would carry",
        input_schema: json!({"type": "object"}),
        handler: handler(|ctx, _args| async move {
            let call = ctx.resolver.resolve(Some(&ctx.auth)).await?;
            Ok(json!({ "token": call.token }))
        }),
    });
    registry
}

fn build_manager(config: ManagerConfig, registry: ToolRegistry) -> SessionManager {
    build_manager_with_hooks(config, registry, SessionHooks::default())
}

fn build_manager_with_hooks(
    config: ManagerConfig,
    registry: ToolRegistry,
    hooks: SessionHooks,
) -> SessionManager {
    let base = Url::parse("https://forge.test").unwrap();
    let forge = Arc::new(ForgeClient::new(base.clone(), Duration::from_secs(5)).unwrap());
    let resolver = Arc::new(
        CredentialResolver::new(
            ResolverConfig {
                default_token: Some("default-token".into()),
                ..ResolverConfig::default()
            },
            base,
            None,
            None,
        )
        .unwrap(),
    );
    SessionManager::with_hooks(config, Arc::new(registry), forge, resolver, hooks)
}

fn initialize_request() -> JsonRpcRequest {
    request("initialize", Some(json!(0)), Some(json!({})))
}

fn request(method: &str, id: Option<Value>, params: Option<Value>) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".into(),
        id,
        method: method.into(),
        params,
    }
}

fn call_record(id: u64) -> JsonRpcRequest {
    request(
        "tools/call",
        Some(json!(id)),
        Some(json!({"name": "record", "arguments": {"seq": id}})),
    )
}

async fn open_session(manager: &SessionManager) -> String {
    let open = manager
        .open_streamable(initialize_request(), None)
        .await
        .unwrap();
    open.session_id.expect("handshake should assign an id")
}

#[tokio::test]
async fn capacity_of_one_rejects_the_second_session() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(
        ManagerConfig {
            max_sessions: 1,
            ..ManagerConfig::default()
        },
        recording_registry(events),
    );

    let session_a = open_session(&manager).await;

    let err = manager
        .open_streamable(initialize_request(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::CapacityExceeded));

    // Session A is untouched by the rejected admission.
    let response = manager
        .dispatch(&session_a, request("ping", Some(json!(1)), None), None)
        .await
        .unwrap()
        .unwrap();
    assert!(!response.is_error());

    let health = manager.health().await;
    assert_eq!(health.streamable_sessions, 1);
    assert_eq!(health.pending_sessions, 0);
    assert!(health.at_capacity);
}

#[tokio::test]
async fn non_initiating_request_cannot_open_a_session() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(ManagerConfig::default(), recording_registry(events));

    let err = manager
        .open_streamable(request("tools/list", Some(json!(1)), None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotInitialized));

    let health = manager.health().await;
    assert_eq!(health.streamable_sessions, 0);
    assert_eq!(health.pending_sessions, 0);
}

#[tokio::test]
async fn failed_handshake_never_becomes_visible() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(ManagerConfig::default(), recording_registry(events));

    // Scalar params are rejected by the handshake before any id exists.
    let open = manager
        .open_streamable(
            request("initialize", Some(json!(1)), Some(json!("bogus"))),
            None,
        )
        .await
        .unwrap();
    assert!(open.session_id.is_none());
    assert!(open.response.is_error());

    let health = manager.health().await;
    assert_eq!(health.streamable_sessions, 0);
    assert_eq!(health.pending_sessions, 0);
}

#[tokio::test]
async fn requests_on_one_session_are_fifo_and_never_overlap() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(
        ManagerConfig::default(),
        recording_registry(events.clone()),
    );
    let session_id = open_session(&manager).await;

    let dispatches: Vec<_> = (0..5)
        .map(|seq| manager.dispatch(&session_id, call_record(seq), None))
        .collect();
    let results = futures::future::join_all(dispatches).await;
    for result in results {
        assert!(!result.unwrap().unwrap().is_error());
    }

    let observed = events.lock().unwrap().clone();
    let expected: Vec<(u64, &str)> = (0..5)
        .flat_map(|seq| [(seq, "start"), (seq, "end")])
        .collect();
    assert_eq!(observed, expected, "requests overlapped or reordered");
}

#[tokio::test]
async fn unknown_session_is_rejected_before_any_work() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(ManagerConfig::default(), recording_registry(events));

    let err = manager
        .dispatch("no-such-session", request("ping", Some(json!(1)), None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownSession(_)));
}

#[tokio::test]
async fn rate_limit_allows_exactly_the_ceiling_then_resets() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(
        ManagerConfig {
            rate_window: Duration::from_millis(100),
            rate_ceiling: 3,
            ..ManagerConfig::default()
        },
        recording_registry(events),
    );
    let session_id = open_session(&manager).await;

    // The initialize handshake does not count against the session window.
    for i in 0..3 {
        manager
            .dispatch(&session_id, request("ping", Some(json!(i)), None), None)
            .await
            .unwrap();
    }
    let err = manager
        .dispatch(&session_id, request("ping", Some(json!(9)), None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::RateLimited));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let response = manager
        .dispatch(&session_id, request("ping", Some(json!(10)), None), None)
        .await
        .unwrap()
        .unwrap();
    assert!(!response.is_error());
}

#[tokio::test]
async fn idle_sweep_skips_sessions_with_inflight_work() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(
        ManagerConfig {
            idle_timeout: Duration::from_secs(0),
            ..ManagerConfig::default()
        },
        recording_registry(events),
    );
    let session_id = open_session(&manager).await;

    // seq 0 sleeps 50ms inside the tool handler.
    let busy = {
        let manager = manager.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { manager.dispatch(&session_id, call_record(0), None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(manager.sweep_idle().await, 0, "mid-request session was swept");
    assert_eq!(manager.health().await.streamable_sessions, 1);

    busy.await.unwrap().unwrap();

    assert_eq!(manager.sweep_idle().await, 1);
    assert_eq!(manager.health().await.streamable_sessions, 0);
}

#[tokio::test]
async fn per_request_override_sticks_and_wins_over_default() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(ManagerConfig::default(), recording_registry(events));
    let session_id = open_session(&manager).await;

    let whoami = |id: u64| {
        request(
            "tools/call",
            Some(json!(id)),
            Some(json!({"name": "whoami", "arguments": {}})),
        )
    };

    // No override yet: the static default applies.
    let response = manager
        .dispatch(&session_id, whoami(1), None)
        .await
        .unwrap()
        .unwrap();
    let text = tool_text(&response);
    assert!(text.contains("default-token"));

    let override_auth = SessionAuth::new(Some("override-token".into()), None, None);
    let response = manager
        .dispatch(&session_id, whoami(2), Some(override_auth))
        .await
        .unwrap()
        .unwrap();
    assert!(tool_text(&response).contains("override-token"));

    // The freshest override remains attached for later requests.
    let response = manager
        .dispatch(&session_id, whoami(3), None)
        .await
        .unwrap()
        .unwrap();
    assert!(tool_text(&response).contains("override-token"));
}

#[tokio::test]
async fn event_stream_sessions_are_addressable_immediately() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(ManagerConfig::default(), recording_registry(events));

    let (session, mut rx) = manager.open_event_stream(None).await.unwrap();
    assert_eq!(manager.health().await.event_stream_sessions, 1);

    manager
        .dispatch_event_stream(session.id(), initialize_request(), None)
        .await
        .unwrap();
    let pushed = rx.recv().await.expect("response should be pushed");
    assert!(!pushed.is_error());

    let err = manager
        .dispatch_event_stream("missing", request("ping", Some(json!(1)), None), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownSession(_)));

    assert!(
        manager
            .close_event_stream(session.id(), CloseReason::ClientDisconnect)
            .await
    );
    assert_eq!(manager.health().await.event_stream_sessions, 0);
}

#[tokio::test]
async fn event_streams_count_toward_capacity() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(
        ManagerConfig {
            max_sessions: 1,
            ..ManagerConfig::default()
        },
        recording_registry(events),
    );

    let (_session, _rx) = manager.open_event_stream(None).await.unwrap();
    let err = manager
        .open_streamable(initialize_request(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::CapacityExceeded));
}

#[tokio::test]
async fn hooks_observe_creation_and_close_reasons() {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let created = log.clone();
    let closed = log.clone();
    let hooks = SessionHooks {
        on_created: Some(Arc::new(move |id, kind| {
            created
                .lock()
                .unwrap()
                .push(format!("created {id} {kind:?}"));
        })),
        on_closed: Some(Arc::new(move |id, reason| {
            closed.lock().unwrap().push(format!("closed {id} {reason:?}"));
        })),
    };
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager =
        build_manager_with_hooks(ManagerConfig::default(), recording_registry(events), hooks);

    let session_id = open_session(&manager).await;
    manager
        .close_streamable(&session_id, CloseReason::Explicit)
        .await;

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert!(log[0].contains("created") && log[0].contains(&session_id));
    assert!(log[0].contains(&format!("{:?}", TransportKind::Streamable)));
    assert!(log[1].contains("Explicit"));
}

#[tokio::test]
async fn shutdown_closes_both_transport_kinds() {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let manager = build_manager(ManagerConfig::default(), recording_registry(events));

    open_session(&manager).await;
    open_session(&manager).await;
    let (_session, _rx) = manager.open_event_stream(None).await.unwrap();

    manager.shutdown().await;

    let health = manager.health().await;
    assert_eq!(health.streamable_sessions, 0);
    assert_eq!(health.pending_sessions, 0);
    assert_eq!(health.event_stream_sessions, 0);
}

fn tool_text(response: &quarry::mcp::protocol::JsonRpcResponse) -> String {
    let encoded = serde_json::to_value(response).unwrap();
    encoded["result"]["content"][0]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}
