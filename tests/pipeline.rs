//! Request lifecycle scenarios driven through an in-memory transport.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use relay_http::{
    CancelReason, CancelToken, ClientOptions, CredentialStore, ErrorKind, MemoryCredentialStore,
    Outcome, RelayClient, RequestOptions, Transport, TransportBody, TransportError,
    TransportRequest, TransportResponse,
};
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use tokio::time::Instant;

const BASE_URL: &str = "https://api.test";

/// What the scripted server does with one request.
enum Scripted {
    Respond(u16, Value),
    Fail(TransportError),
    /// Responds after a delay; gives up early if cancelled.
    After(Duration, Box<Scripted>),
    /// Never answers.
    Hang,
}

type Script = dyn Fn(&TransportRequest) -> Scripted + Send + Sync;

struct ScriptedTransport {
    script: Box<Script>,
    calls: Mutex<Vec<(Instant, TransportRequest)>>,
}

impl ScriptedTransport {
    fn new(script: impl Fn(&TransportRequest) -> Scripted + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_to(&self, path: &str) -> Vec<(Instant, TransportRequest)> {
        self.calls
            .lock()
            .expect("call log mutex must not be poisoned")
            .iter()
            .filter(|(_, request)| path_of(request) == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancelToken,
    ) -> Result<TransportResponse, TransportError> {
        let mut step = (self.script)(&request);
        self.calls
            .lock()
            .expect("call log mutex must not be poisoned")
            .push((Instant::now(), request));

        loop {
            step = match step {
                Scripted::Respond(status, body) => {
                    return Ok(TransportResponse {
                        status,
                        headers: HeaderMap::new(),
                        body: Bytes::from(body.to_string()),
                    })
                }
                Scripted::Fail(err) => return Err(err),
                Scripted::After(delay, next) => {
                    tokio::select! {
                        reason = cancel.cancelled() => {
                            return Err(TransportError::Cancelled(reason));
                        }
                        _ = tokio::time::sleep(delay) => *next,
                    }
                }
                Scripted::Hang => {
                    return Err(TransportError::Cancelled(cancel.cancelled().await));
                }
            }
        }
    }
}

fn path_of(request: &TransportRequest) -> &str {
    request.url.strip_prefix(BASE_URL).unwrap_or(&request.url)
}

fn bearer(request: &TransportRequest) -> Option<&str> {
    request
        .headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
}

fn ok(data: Value) -> Scripted {
    Scripted::Respond(200, json!({"code": 0, "data": data}))
}

fn client_with(
    transport: Arc<ScriptedTransport>,
    store: Arc<MemoryCredentialStore>,
) -> RelayClient {
    RelayClient::new(BASE_URL)
        .with_transport(transport)
        .with_credential_store(store)
}

fn tokens(access: &str, refresh: &str) -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::with_tokens(
        access,
        Some(refresh.to_owned()),
    ))
}

#[tokio::test(start_paused = true)]
async fn identical_request_supersedes_the_first() {
    let transport = ScriptedTransport::new(|request| {
        Scripted::After(Duration::from_millis(100), Box::new(ok(json!({"path": path_of(request)}))))
    });
    let client = client_with(transport.clone(), tokens("tok1", "r1"));

    let send = |client: RelayClient| {
        tokio::spawn(async move { client.post::<Value, _>("/orders", &json!({"id": 1})).await })
    };

    let first = send(client.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.pending_requests(), 1);

    let second = send(client.clone());
    let first = first
        .await
        .expect("task must not panic")
        .expect("supersession is not an error");
    assert_eq!(first, Outcome::Cancelled(CancelReason::Superseded));
    assert_eq!(client.pending_requests(), 1);

    let second = second
        .await
        .expect("task must not panic")
        .expect("second request must succeed");
    assert_eq!(second, Outcome::Completed(json!({"path": "/orders"})));
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(transport.calls_to("/orders").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_duplicate_leaves_the_in_flight_request_alone() {
    let transport = ScriptedTransport::new(|_| {
        Scripted::After(Duration::from_millis(100), Box::new(ok(json!("orders"))))
    });
    let client = client_with(transport.clone(), tokens("tok1", "r1"));

    let good = {
        let client = client.clone();
        tokio::spawn(async move { client.get::<Value, _>("/orders", &()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = client
        .get_with::<Value, _>("/orders", &(), RequestOptions::default().header("bad header", "x"))
        .await
        .expect_err("invalid header must be rejected");
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(client.pending_requests(), 1);

    let good = good.await.expect("task must not panic").expect("must succeed");
    assert_eq!(good, Outcome::Completed(json!("orders")));
    assert_eq!(transport.calls_to("/orders").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dedupe_can_be_disabled_per_request() {
    let transport = ScriptedTransport::new(|_| {
        Scripted::After(Duration::from_millis(100), Box::new(ok(json!(1))))
    });
    let client = client_with(transport.clone(), tokens("tok1", "r1"));

    let send = |client: RelayClient| {
        tokio::spawn(async move {
            client
                .get_with::<Value, _>("/stats", &(), RequestOptions::default().dedupe(false))
                .await
        })
    };
    let first = send(client.clone());
    let second = send(client.clone());

    for handle in [first, second] {
        let outcome = handle.await.expect("task must not panic").expect("must succeed");
        assert_eq!(outcome, Outcome::Completed(json!(1)));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_401s_share_one_refresh() {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();
    let transport = ScriptedTransport::new(move |request| {
        if path_of(request) == "/auth/refresh" {
            counter.fetch_add(1, Ordering::SeqCst);
            return Scripted::After(
                Duration::from_millis(50),
                Box::new(ok(json!({"accessToken": "tok2", "refreshToken": "r2"}))),
            );
        }
        match bearer(request) {
            Some("Bearer tok2") => ok(json!(path_of(request))),
            _ => Scripted::Respond(401, json!({"message": "token expired"})),
        }
    });
    let store = tokens("tok1", "r1");
    let client = client_with(transport.clone(), store.clone());

    let handles: Vec<_> = ["/a", "/b", "/c"]
        .into_iter()
        .map(|path| {
            let client = client.clone();
            tokio::spawn(async move { client.get::<Value, _>(path, &()).await })
        })
        .collect();

    for (handle, path) in handles.into_iter().zip(["/a", "/b", "/c"]) {
        let outcome = handle.await.expect("task must not panic").expect("must succeed");
        assert_eq!(outcome, Outcome::Completed(json!(path)));
    }
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(store.access_token().as_deref(), Some("tok2"));
    assert_eq!(store.refresh_token().as_deref(), Some("r2"));
}

#[tokio::test]
async fn replay_carries_refreshed_token() {
    let transport = ScriptedTransport::new(|request| match (path_of(request), bearer(request)) {
        ("/auth/refresh", _) => Scripted::Respond(200, json!({"accessToken": "tok2"})),
        ("/profile", Some("Bearer tok2")) => ok(json!({"name": "Kit"})),
        _ => Scripted::Respond(401, json!({})),
    });
    let client = client_with(transport.clone(), tokens("tok1", "r1"));

    let profile = client
        .get::<Value, _>("/profile", &())
        .await
        .expect("must succeed after refresh");
    assert_eq!(profile, Outcome::Completed(json!({"name": "Kit"})));

    let calls = transport.calls_to("/profile");
    assert_eq!(calls.len(), 2);
    assert_eq!(bearer(&calls[0].1), Some("Bearer tok1"));
    assert_eq!(bearer(&calls[1].1), Some("Bearer tok2"));

    // a refresh response without a new refresh token keeps the old one
    assert_eq!(client.credentials().refresh_token().as_deref(), Some("r1"));
}

#[tokio::test]
async fn second_401_does_not_refresh_again() {
    let transport = ScriptedTransport::new(|request| match path_of(request) {
        "/auth/refresh" => ok(json!({"accessToken": "tok2", "refreshToken": "r2"})),
        _ => Scripted::Respond(401, json!({})),
    });
    let client = client_with(transport.clone(), tokens("tok1", "r1"));
    let mut expired = client.subscribe_session_expired();

    let err = client
        .get::<Value, _>("/profile", &())
        .await
        .expect_err("must fail after one refresh");

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(err.status(), Some(401));
    assert_eq!(transport.calls_to("/auth/refresh").len(), 1);
    assert_eq!(transport.calls_to("/profile").len(), 2);
    assert!(expired.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_rejects_every_waiter_and_signals_once() {
    let transport = ScriptedTransport::new(|request| match path_of(request) {
        "/auth/refresh" => Scripted::After(
            Duration::from_millis(50),
            Box::new(Scripted::Respond(401, json!({"message": "revoked"}))),
        ),
        _ => Scripted::Respond(401, json!({})),
    });
    let store = tokens("tok1", "r1");
    let client = client_with(transport.clone(), store.clone());
    let mut expired = client.subscribe_session_expired();

    let handles: Vec<_> = ["/a", "/b", "/c"]
        .into_iter()
        .map(|path| {
            let client = client.clone();
            tokio::spawn(async move { client.get::<Value, _>(path, &()).await })
        })
        .collect();

    for handle in handles {
        let err = handle
            .await
            .expect("task must not panic")
            .expect_err("every caller must be rejected");
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.message(), "Session expired, please sign in again");
    }
    assert_eq!(transport.calls_to("/auth/refresh").len(), 1);
    assert!(expired.try_recv().is_ok());
    assert!(expired.try_recv().is_err());
    assert!(store.access_token().is_none());
}

#[tokio::test]
async fn missing_refresh_token_expires_session_without_calling_endpoint() {
    let transport = ScriptedTransport::new(|_| Scripted::Respond(401, json!({})));
    let store = Arc::new(MemoryCredentialStore::with_tokens("tok1", None));
    let client = client_with(transport.clone(), store);
    let mut expired = client.subscribe_session_expired();

    let err = client
        .get::<Value, _>("/profile", &())
        .await
        .expect_err("must fail");

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(transport.calls_to("/auth/refresh").is_empty());
    assert!(expired.try_recv().is_ok());
}

#[tokio::test]
async fn unauthenticated_request_never_refreshes() {
    let transport = ScriptedTransport::new(|_| Scripted::Respond(401, json!({"message": "nope"})));
    let client = client_with(transport.clone(), tokens("tok1", "r1"));

    let err = client
        .post_with::<Value, _>(
            "/login",
            &json!({"user": "kit"}),
            RequestOptions::default().without_auth(),
        )
        .await
        .expect_err("401 must fail");

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(err.message(), "nope");
    assert!(transport.calls_to("/auth/refresh").is_empty());
    assert!(bearer(&transport.calls_to("/login")[0].1).is_none());
}

#[tokio::test(start_paused = true)]
async fn network_failures_back_off_exponentially() {
    let transport =
        ScriptedTransport::new(|_| Scripted::Fail(TransportError::Network(String::new())));
    let client = client_with(transport.clone(), tokens("tok1", "r1"));

    let err = client
        .get::<Value, _>("/health", &())
        .await
        .expect_err("must fail after retries");

    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(err.status().is_none());

    let calls = transport.calls_to("/health");
    assert_eq!(calls.len(), 3);
    let gaps = [calls[1].0 - calls[0].0, calls[2].0 - calls[1].0];
    for (gap, expected) in gaps.into_iter().zip([500, 1_000]) {
        let expected = Duration::from_millis(expected);
        assert!(gap >= expected && gap < expected + Duration::from_millis(5), "gap {gap:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn retry_budget_follows_client_options() {
    let transport = ScriptedTransport::new(|_| Scripted::Respond(502, json!({})));
    let client = client_with(transport.clone(), tokens("tok1", "r1")).with_options(ClientOptions {
        base_url: BASE_URL.to_owned(),
        max_retries: 3,
        retry_backoff_ms: 10,
        ..ClientOptions::default()
    });

    let err = client
        .get::<Value, _>("/gateway", &())
        .await
        .expect_err("must fail");

    assert_eq!(err.status(), Some(502));
    assert_eq!(err.message(), "Bad gateway, please try again later");
    assert_eq!(transport.calls_to("/gateway").len(), 4);
}

#[tokio::test]
async fn auto_retry_can_be_disabled() {
    let transport = ScriptedTransport::new(|_| Scripted::Respond(500, json!({})));
    let client = client_with(transport.clone(), tokens("tok1", "r1"));

    let err = client
        .get_with::<Value, _>("/once", &(), RequestOptions::default().without_retry())
        .await
        .expect_err("must fail");

    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(transport.calls_to("/once").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_cancels_in_flight_requests() {
    let transport = ScriptedTransport::new(|_| Scripted::Hang);
    let client = client_with(transport, tokens("tok1", "r1"));

    let handles: Vec<_> = ["/a", "/b"]
        .into_iter()
        .map(|path| {
            let client = client.clone();
            tokio::spawn(async move { client.get::<Value, _>(path, &()).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.pending_requests(), 2);

    client.cancel_all_requests();

    for handle in handles {
        let outcome = handle.await.expect("task must not panic").expect("not an error");
        assert_eq!(outcome, Outcome::Cancelled(CancelReason::CancelAll));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_during_refresh_cancels_silently_and_never_overlaps_refreshes() {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = refreshes.clone();
    let transport = ScriptedTransport::new(move |request| {
        if path_of(request) == "/auth/refresh" {
            let tokens = match counter.fetch_add(1, Ordering::SeqCst) {
                0 => json!({"accessToken": "stale", "refreshToken": "r-stale"}),
                _ => json!({"accessToken": "tok2", "refreshToken": "r2"}),
            };
            return Scripted::After(Duration::from_millis(1_000), Box::new(ok(tokens)));
        }
        match bearer(request) {
            Some("Bearer tok2") => ok(json!(path_of(request))),
            _ => Scripted::Respond(401, json!({})),
        }
    });
    let store = tokens("tok1", "r1");
    let client = client_with(transport.clone(), store.clone());
    let mut expired = client.subscribe_session_expired();

    let spawn_get = |path: &'static str| {
        let client = client.clone();
        tokio::spawn(async move { client.get::<Value, _>(path, &()).await })
    };

    let leader = spawn_get("/a");
    tokio::time::sleep(Duration::from_millis(10)).await;
    let waiter = spawn_get("/b");
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.cancel_all_requests();
    let waiter = waiter.await.expect("task must not panic").expect("not an error");
    assert_eq!(waiter, Outcome::Cancelled(CancelReason::CancelAll));

    let newcomer = spawn_get("/c");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    let leader = leader.await.expect("task must not panic").expect("not an error");
    assert_eq!(leader, Outcome::Cancelled(CancelReason::CancelAll));

    let newcomer = newcomer.await.expect("task must not panic").expect("must succeed");
    assert_eq!(newcomer, Outcome::Completed(json!("/c")));

    let calls = transport.calls_to("/auth/refresh");
    assert_eq!(calls.len(), 2);
    assert!(calls[1].0 - calls[0].0 >= Duration::from_millis(1_000));
    let TransportBody::Json(body) = &calls[1].1.body else {
        panic!("refresh body must be JSON");
    };
    let body: Value = serde_json::from_slice(body).expect("refresh body must parse");
    assert_eq!(body["refreshToken"], "r1");

    assert_eq!(transport.calls_to("/a").len(), 1);
    assert_eq!(store.access_token().as_deref(), Some("tok2"));
    assert!(expired.try_recv().is_err());
}

#[tokio::test]
async fn options_reports_status_and_skips_dedupe() {
    let transport = ScriptedTransport::new(|_| Scripted::Respond(204, json!(null)));
    let client = client_with(transport.clone(), tokens("tok1", "r1"));

    let meta = client
        .options("/orders")
        .await
        .expect("must succeed")
        .completed()
        .expect("not cancelled");

    assert_eq!(meta.status, 204);
    let calls = transport.calls_to("/orders");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.method, reqwest::Method::OPTIONS);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn caller_cancel_interrupts_backoff() {
    let transport = ScriptedTransport::new(|_| {
        Scripted::Fail(TransportError::Network("refused".to_owned()))
    });
    let client = client_with(transport.clone(), tokens("tok1", "r1"));
    let token = client.create_cancel_token();

    let handle = {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move {
            client
                .get_with::<Value, _>("/health", &(), RequestOptions::default().cancel_token(token))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let outcome = handle.await.expect("task must not panic").expect("not an error");
    assert!(matches!(outcome, Outcome::Cancelled(CancelReason::Caller(_))));
    assert_eq!(transport.calls_to("/health").len(), 1);
}

#[tokio::test]
async fn already_cancelled_token_skips_the_network() {
    let transport = ScriptedTransport::new(|_| ok(json!(null)));
    let client = client_with(transport.clone(), tokens("tok1", "r1"));
    let token = CancelToken::new();
    token.cancel();

    let outcome = client
        .get_with::<Value, _>("/never", &(), RequestOptions::default().cancel_token(token))
        .await
        .expect("not an error");

    assert!(outcome.is_cancelled());
    assert!(transport.calls_to("/never").is_empty());
}

#[tokio::test]
async fn decode_failure_keeps_payload() {
    let transport = ScriptedTransport::new(|_| ok(json!({"id": "not-a-number"})));
    let client = client_with(transport, tokens("tok1", "r1"));

    #[derive(Debug, serde::Deserialize)]
    struct Order {
        #[allow(dead_code)]
        id: u64,
    }

    let err = client
        .get::<Order, _>("/orders/1", &())
        .await
        .expect_err("must not decode");

    assert_eq!(err.kind(), ErrorKind::Decode);
    assert_eq!(err.payload(), Some(&json!({"id": "not-a-number"})));
}
