//! End-to-end gateway tests
//!
//! Each test boots the full gateway against an in-process mock upstream on
//! an ephemeral port and drives it over real HTTP. No network access
//! beyond localhost.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use llm_gateway::config::{ApiKeys, Capabilities, Config, ProviderConfig, RouteSpec};
use llm_gateway::gateway::{Gateway, create_router};

/// Recorded call against a mock upstream.
#[derive(Debug, Clone)]
struct UpstreamHit {
    started_at: Instant,
    body: Value,
}

#[derive(Clone, Default)]
struct MockLog {
    hits: Arc<Mutex<Vec<UpstreamHit>>>,
    counter: Arc<AtomicUsize>,
}

impl MockLog {
    fn count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    fn hits(&self) -> Vec<UpstreamHit> {
        self.hits.lock().clone()
    }
}

/// Spawn a mock chat-completions upstream whose behaviour is a function of
/// the 1-based hit number and the request body.
async fn spawn_upstream<F>(behavior: F) -> (SocketAddr, MockLog)
where
    F: Fn(usize, &Value) -> (StatusCode, Value) + Clone + Send + Sync + 'static,
{
    let log = MockLog::default();
    let log_for_handler = log.clone();

    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(body): Json<Value>| {
            let behavior = behavior.clone();
            let log = log_for_handler.clone();
            async move {
                let hit = log.counter.fetch_add(1, Ordering::SeqCst) + 1;
                log.hits.lock().push(UpstreamHit {
                    started_at: Instant::now(),
                    body: body.clone(),
                });
                let (status, payload) = behavior(hit, &body);
                (status, Json(payload)).into_response()
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, log)
}

/// A delayed variant: the Nth hit sleeps before answering.
async fn spawn_slow_upstream(delay_hit: usize, delay: Duration) -> (SocketAddr, MockLog) {
    let log = MockLog::default();
    let log_for_handler = log.clone();

    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(body): Json<Value>| {
            let log = log_for_handler.clone();
            async move {
                let hit = log.counter.fetch_add(1, Ordering::SeqCst) + 1;
                log.hits.lock().push(UpstreamHit {
                    started_at: Instant::now(),
                    body: body.clone(),
                });
                if hit == delay_hit {
                    tokio::time::sleep(delay).await;
                }
                Json(text_completion(&format!("reply-{hit}"))).into_response()
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, log)
}

fn text_completion(text: &str) -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": "m1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1}
    })
}

fn provider_for(addr: SocketAddr, fixes: &[&str]) -> ProviderConfig {
    ProviderConfig {
        protocol: "openai".into(),
        api_base_url: format!("http://{addr}"),
        api_key: ApiKeys::One("sk-test".into()),
        models: vec!["m1".into()],
        capabilities: Capabilities::default(),
        parameter_limits: HashMap::new(),
        response_fixes: fixes
            .iter()
            .map(|f| serde_json::from_value(json!(f)).unwrap())
            .collect(),
        model_aliases: HashMap::new(),
        timeout: Duration::from_secs(5),
    }
}

/// Boot a gateway for the given providers/routes; returns its base URL.
async fn spawn_gateway(
    providers: Vec<(&str, ProviderConfig)>,
    routes: Vec<(&str, RouteSpec)>,
) -> String {
    let mut config = Config::default();
    for (name, provider) in providers {
        config.providers.insert(name.to_string(), provider);
    }
    for (name, route) in routes {
        config.routing.insert(name.to_string(), route);
    }
    // Fast retries keep the failover tests snappy.
    config.switching.cooldown_base = Duration::from_millis(50);
    config.server.request_timeout = Duration::from_secs(10);

    let gateway = Gateway::new(config).expect("gateway must assemble");
    let app = create_router(gateway.state());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn messages_body(text: &str) -> Value {
    json!({
        "model": "default",
        "max_tokens": 50,
        "messages": [{"role": "user", "content": text}]
    })
}

// ── happy path ───────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_non_streaming() {
    let (upstream, _log) =
        spawn_upstream(|_, _| (StatusCode::OK, text_completion("hello"))).await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().contains_key("x-request-id"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["model"], "default");
    assert_eq!(body["content"], json!([{"type": "text", "text": "hello"}]));
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"], json!({"input_tokens": 1, "output_tokens": 1}));
}

#[tokio::test]
async fn upstream_receives_translated_openai_request() {
    let (upstream, log) =
        spawn_upstream(|_, _| (StatusCode::OK, text_completion("ok"))).await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let body = json!({
        "model": "default",
        "max_tokens": 50,
        "system": "be brief",
        "messages": [{"role": "user", "content": "hi"}]
    });
    reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let hits = log.hits();
    assert_eq!(hits.len(), 1);
    let sent = &hits[0].body;
    // Virtual model rewritten to the concrete one.
    assert_eq!(sent["model"], "m1");
    // System prompt collapsed into a leading message.
    assert_eq!(sent["messages"][0]["role"], "system");
    assert_eq!(sent["messages"][0]["content"], "be brief");
    assert_eq!(sent["messages"][1]["role"], "user");
    assert_eq!(sent["max_tokens"], 50);
}

// ── tool calls ───────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_call_round_trip() {
    let (upstream, _log) = spawn_upstream(|_, _| {
        (
            StatusCode::OK,
            json!({
                "id": "chatcmpl-1",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "get_weather", "arguments": "{\"city\":\"NYC\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 3}
            }),
        )
    })
    .await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let body = json!({
        "model": "default",
        "max_tokens": 50,
        "messages": [{"role": "user", "content": "weather in NYC?"}],
        "tools": [{
            "name": "get_weather",
            "description": "weather lookup",
            "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
        }]
    });
    let response: Value = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["stop_reason"], "tool_use");
    assert_eq!(response["content"][0]["type"], "tool_use");
    assert_eq!(response["content"][0]["name"], "get_weather");
    assert_eq!(response["content"][0]["input"], json!({"city": "NYC"}));
}

#[tokio::test]
async fn textual_tool_call_extraction() {
    let (upstream, _log) = spawn_upstream(|_, _| {
        (
            StatusCode::OK,
            text_completion("Sure.\n\nTool call: Bash({\"command\":\"ls\"})\n\nDone."),
        )
    })
    .await;
    let base = spawn_gateway(
        vec![(
            "p1",
            provider_for(upstream, &["basic_standardization", "extract_textual_tool_calls"]),
        )],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let response: Value = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("run ls"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(response["stop_reason"], "tool_use");
    let content = response["content"].as_array().unwrap();
    let text_block = content
        .iter()
        .find(|b| b["type"] == "text")
        .expect("a text block must survive");
    assert_eq!(text_block["text"].as_str().unwrap().trim(), "Sure.\n\nDone.");
    let tool_block = content
        .iter()
        .find(|b| b["type"] == "tool_use")
        .expect("a tool_use block must be synthesised");
    assert_eq!(tool_block["name"], "Bash");
    assert_eq!(tool_block["input"], json!({"command": "ls"}));
}

// ── failover ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn recoverable_failover_to_second_pipeline() {
    let (upstream_a, log_a) = spawn_upstream(|_, _| {
        (StatusCode::SERVICE_UNAVAILABLE, json!({"error": "down"}))
    })
    .await;
    let (upstream_b, log_b) =
        spawn_upstream(|_, _| (StatusCode::OK, text_completion("from-b"))).await;

    let mut provider_b = provider_for(upstream_b, &[]);
    provider_b.models = vec!["m2".into()];

    let base = spawn_gateway(
        vec![("pa", provider_for(upstream_a, &[])), ("pb", provider_b)],
        vec![(
            "default",
            RouteSpec::Many(vec!["pa,m1".into(), "pb,m2".into()]),
        )],
    )
    .await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200, "failover must hide the 503");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["content"][0]["text"], "from-b");
    assert_eq!(log_a.count(), 1);
    assert_eq!(log_b.count(), 1);
}

#[tokio::test]
async fn non_recoverable_blacklist_skips_pipeline() {
    let (upstream_a, log_a) =
        spawn_upstream(|_, _| (StatusCode::UNAUTHORIZED, json!({"error": "bad key"}))).await;
    let (upstream_b, _log_b) =
        spawn_upstream(|_, _| (StatusCode::OK, text_completion("from-b"))).await;

    let mut provider_b = provider_for(upstream_b, &[]);
    provider_b.models = vec!["m2".into()];

    let base = spawn_gateway(
        vec![("pa", provider_for(upstream_a, &[])), ("pb", provider_b)],
        vec![(
            "default",
            RouteSpec::Many(vec!["pa,m1".into(), "pb,m2".into()]),
        )],
    )
    .await;

    let client = reqwest::Client::new();
    // First request: A fails with 401, gets blacklisted, B answers.
    let first: Value = client
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("one"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["content"][0]["text"], "from-b");
    assert_eq!(log_a.count(), 1);

    // Second request: A is skipped entirely.
    let second: Value = client
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("two"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["content"][0]["text"], "from-b");
    assert_eq!(log_a.count(), 1, "blacklisted pipeline must not be called again");

    // The health surface reflects the blacklisting.
    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["overall"], "degraded");
    assert_eq!(health["providers"]["pa"], false);
    assert_eq!(health["providers"]["pb"], true);
}

#[tokio::test]
async fn terminal_error_surfaces_unchanged() {
    let (upstream, log) = spawn_upstream(|_, _| {
        (StatusCode::BAD_REQUEST, json!({"error": {"message": "bad request"}}))
    })
    .await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    // Terminal errors are not retried.
    assert_eq!(log.count(), 1);
}

// ── conversation queueing ────────────────────────────────────────────────

#[tokio::test]
async fn same_conversation_is_serialised_in_send_order() {
    let (upstream, log) = spawn_slow_upstream(1, Duration::from_millis(100)).await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let client = reqwest::Client::new();
    let send = |text: &str| {
        let client = client.clone();
        let url = format!("{base}/v1/messages");
        let body = messages_body(text);
        async move {
            client
                .post(url)
                .header("x-conversation-id", "conv-1")
                .header("x-session-id", "sess-1")
                .json(&body)
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        }
    };

    let first = send("first");
    // Give the first request a head start so enqueue order is deterministic.
    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        send("second").await
    };
    let (r1, r2) = tokio::join!(first, second);

    assert_eq!(r1["content"][0]["text"], "reply-1");
    assert_eq!(r2["content"][0]["text"], "reply-2");

    let hits = log.hits();
    assert_eq!(hits.len(), 2);
    let gap = hits[1].started_at.duration_since(hits[0].started_at);
    assert!(
        gap >= Duration::from_millis(90),
        "second request must wait for the first to finish, gap was {gap:?}"
    );
}

#[tokio::test]
async fn different_conversations_are_not_serialised() {
    let (upstream, log) = spawn_slow_upstream(1, Duration::from_millis(100)).await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let client = reqwest::Client::new();
    let send = |conversation: &str| {
        let client = client.clone();
        let url = format!("{base}/v1/messages");
        let conversation = conversation.to_string();
        async move {
            client
                .post(url)
                .header("x-conversation-id", conversation)
                .header("x-session-id", "sess-1")
                .json(&messages_body("hi"))
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        }
    };

    let first = send("conv-a");
    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        send("conv-b").await
    };
    let _ = tokio::join!(first, second);

    let hits = log.hits();
    assert_eq!(hits.len(), 2);
    let gap = hits[1].started_at.duration_since(hits[0].started_at);
    assert!(
        gap < Duration::from_millis(90),
        "independent conversations must overlap, gap was {gap:?}"
    );
}

// ── streaming ────────────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_response_emits_anthropic_event_sequence() {
    let (upstream, _log) =
        spawn_upstream(|_, _| (StatusCode::OK, text_completion("streamed hello"))).await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let mut body = messages_body("hi");
    body["stream"] = json!(true);
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .contains("text/event-stream")
    );
    let text = response.text().await.unwrap();

    // Events in the Anthropic order, each framed as event:/data: lines.
    let positions: Vec<usize> = [
        "event: message_start",
        "event: content_block_start",
        "event: content_block_delta",
        "event: content_block_stop",
        "event: message_delta",
        "event: message_stop",
    ]
    .iter()
    .map(|needle| text.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
    .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "events must be in prescribed order");
    assert!(text.contains("streamed hello"));
}

#[tokio::test]
async fn streaming_error_emits_error_event() {
    let (upstream, _log) = spawn_upstream(|_, _| {
        (StatusCode::BAD_REQUEST, json!({"error": {"message": "nope"}}))
    })
    .await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let mut body = messages_body("hi");
    body["stream"] = json!(true);
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let text = response.text().await.unwrap();
    assert!(text.contains("event: error"));
    assert!(text.contains("invalid_request_error"));
}

// ── validation and operational surfaces ──────────────────────────────────

#[tokio::test]
async fn invalid_request_is_rejected_with_anthropic_error_shape() {
    let (upstream, log) =
        spawn_upstream(|_, _| (StatusCode::OK, text_completion("unused"))).await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    // Missing max_tokens.
    let response = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&json!({"model": "default", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(log.count(), 0, "invalid requests must never reach upstream");
}

#[tokio::test]
async fn status_and_stats_endpoints_respond() {
    let (upstream, _log) =
        spawn_upstream(|_, _| (StatusCode::OK, text_completion("hello"))).await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let client = reqwest::Client::new();
    client
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("hi"))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let status: Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["server"], "llm-gateway");
    assert_eq!(status["providers"], json!(["p1"]));

    let stats: Value = client
        .get(format!("{base}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["successes"], 1);
    assert_eq!(stats["total_requests"], 1);

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["overall"], "healthy");
    assert_eq!(health["healthy"], 1);
    assert_eq!(health["total"], 1);
}

#[tokio::test]
async fn pipeline_reset_restores_blacklisted_pipeline() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_behavior = Arc::clone(&hits);
    // First call 401 (blacklist), later calls succeed.
    let (upstream, _log) = spawn_upstream(move |hit, _| {
        hits_for_behavior.store(hit, Ordering::SeqCst);
        if hit == 1 {
            (StatusCode::UNAUTHORIZED, json!({"error": "bad key"}))
        } else {
            (StatusCode::OK, text_completion("recovered"))
        }
    })
    .await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let client = reqwest::Client::new();
    // Blacklist the only pipeline.
    let first = client
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status().as_u16(), 401);

    // Route now has no healthy pipeline.
    let second = client
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 502);

    // Operator reset brings it back.
    let reset: Value = client
        .post(format!("{base}/pipelines/pipeline_p1_m1/reset"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reset["status"], "healthy");

    let third: Value = client
        .post(format!("{base}/v1/messages"))
        .json(&messages_body("hi"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(third["content"][0]["text"], "recovered");
}

#[tokio::test]
async fn unknown_virtual_model_falls_back_to_default_route() {
    let (upstream, _log) =
        spawn_upstream(|_, _| (StatusCode::OK, text_completion("fallback"))).await;
    let base = spawn_gateway(
        vec![("p1", provider_for(upstream, &[]))],
        vec![("default", RouteSpec::One("p1,m1".into()))],
    )
    .await;

    let mut body = messages_body("hi");
    body["model"] = json!("some-unknown-model");
    let response: Value = reqwest::Client::new()
        .post(format!("{base}/v1/messages"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // Virtual model name is echoed, not the concrete one.
    assert_eq!(response["model"], "some-unknown-model");
    assert_eq!(response["content"][0]["text"], "fallback");
}
