use std::sync::atomic::{AtomicUsize, Ordering};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose, Engine as _};
use chaton_relay::proxy::{build_router, AppState, Credential, GatewayConfig};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request as MockRequest, Respond, ResponseTemplate};

const HI_STREAM: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"index\":0}]}\n\n\
data: {\"ping\":1}\n\n\
data: {\"data\":{\"web\":{\"sources\":[{\"title\":\"T\",\"url\":\"U\"}]}}}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\" there\"},\"index\":0}]}\n\n\
data: [DONE]\n\n";

fn router_for(server: &MockServer) -> Router {
    let config = GatewayConfig {
        credential: Credential::new("key-a", "key-b"),
        upstream_base: url::Url::parse(&server.uri()).unwrap(),
        ..GatewayConfig::default()
    };
    build_router(AppState::new(config).unwrap())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn mount_chat_stream(server: &MockServer, sse: &'static str) {
    Mock::given(method("POST"))
        .and(path("/chats/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(server)
        .await;
}

/// 每次生图请求返回不同的存储路径
struct NumberedImage {
    counter: AtomicUsize,
}

impl Respond for NumberedImage {
    fn respond(&self, _request: &MockRequest) -> ResponseTemplate {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let sse = format!(
            "data: {}\n\ndata: [DONE]\n\n",
            json!({"choices": [{"delta": {"content": format!("![Image](https://spc.unk/gen/{}.png)", n)}, "index": 0}]})
        );
        ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream")
    }
}

/// 存储查询：把路径映射到 mock 服务器上的 /cdn 地址
struct StorageLookup {
    base: String,
}

impl Respond for StorageLookup {
    fn respond(&self, request: &MockRequest) -> ResponseTemplate {
        let file = request.url.path().trim_start_matches("/storage/gen/");
        ResponseTemplate::new(200).set_body_json(json!({"getUrl": format!("{}/cdn/{}", self.base, file)}))
    }
}

#[tokio::test]
async fn chat_completion_aggregates_in_arrival_order() {
    let server = MockServer::start().await;
    mount_chat_stream(&server, HI_STREAM).await;

    let response = router_for(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hello"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hi\n### T\nU\n there");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["model"], "gpt-4o");
}

#[tokio::test]
async fn chat_completion_streams_chunks_then_done() {
    let server = MockServer::start().await;
    mount_chat_stream(&server, HI_STREAM).await;

    let response = router_for(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "gpt-4o", "stream": true, "messages": [{"role": "user", "content": "hello"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(response.headers()["cache-control"], "no-cache");

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let data: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();

    assert_eq!(data.len(), 4);
    let contents: Vec<String> = data[..3]
        .iter()
        .map(|d| {
            let v: Value = serde_json::from_str(d).unwrap();
            assert_eq!(v["object"], "chat.completion.chunk");
            v["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(contents, vec!["Hi", "\n### T\nU\n", " there"]);
    assert_eq!(data[3], "[DONE]");
}

const IMAGE_STREAM: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Sure!\\n\\n![Image](https://spc.unk/gen/a.png)\"},\"index\":0}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"\\n\\nHere is your cat.\"},\"index\":0}]}\n\n\
data: [DONE]\n\n";

async fn mount_storage_a(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/storage/gen/a.png"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"getUrl": "https://cdn.example/a.png"})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn streamed_generated_image_is_resolved() {
    let server = MockServer::start().await;
    mount_chat_stream(&server, IMAGE_STREAM).await;
    mount_storage_a(&server).await;

    let response = router_for(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"stream": true, "messages": [{"role": "user", "content": "draw a cat"}]}),
        ))
        .await
        .unwrap();

    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let data: Vec<&str> = text.lines().filter_map(|l| l.strip_prefix("data: ")).collect();
    assert_eq!(data.len(), 3);
    let contents: Vec<String> = data[..2]
        .iter()
        .map(|d| {
            let v: Value = serde_json::from_str(d).unwrap();
            v["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(
        contents,
        vec![
            "Sure!".to_string(),
            "\n\n![Image](https://cdn.example/a.png)\n\nHere is your cat.".to_string(),
        ]
    );
    assert_eq!(data[2], "[DONE]");
}

#[tokio::test]
async fn generated_image_text_matches_between_stream_and_aggregate() {
    let server = MockServer::start().await;
    mount_chat_stream(&server, IMAGE_STREAM).await;
    mount_storage_a(&server).await;
    let router = router_for(&server);

    let response = router
        .clone()
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "draw a cat"}]}),
        ))
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let aggregated = body["choices"][0]["message"]["content"].as_str().unwrap().to_string();

    let response = router
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"stream": true, "messages": [{"role": "user", "content": "draw a cat"}]}),
        ))
        .await
        .unwrap();
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    let streamed: String = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter(|d| *d != "[DONE]")
        .map(|d| {
            let v: Value = serde_json::from_str(d).unwrap();
            v["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
        })
        .collect();

    assert_eq!(aggregated, "Sure!\n\n![Image](https://cdn.example/a.png)\n\nHere is your cat.");
    assert_eq!(streamed, aggregated);
}

#[tokio::test]
async fn invalid_utf8_frame_is_skipped() {
    let server = MockServer::start().await;
    let mut sse = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"index\":0}]}\n\n".to_vec();
    sse.extend_from_slice(b"data: \xff\xfe\n\n");
    sse.extend_from_slice(b"data: {\"choices\":[{\"delta\":{\"content\":\" there\"},\"index\":0}]}\n\n");
    sse.extend_from_slice(b"data: [DONE]\n\n");
    Mock::given(method("POST"))
        .and(path("/chats/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(&server)
        .await;

    let response = router_for(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "hello"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Hi there");
}

#[tokio::test]
async fn empty_messages_rejected_without_upstream_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let response = router_for(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "   "}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let server = MockServer::start().await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = router_for(&server).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upstream_status_is_propagated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chats/stream"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let response = router_for(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "hello"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn missing_credentials_is_server_error() {
    let server = MockServer::start().await;
    let config = GatewayConfig {
        upstream_base: url::Url::parse(&server.uri()).unwrap(),
        ..GatewayConfig::default()
    };
    let response = build_router(AppState::new(config).unwrap())
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "hello"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"]["type"], "config_error");
}

#[tokio::test]
async fn list_models_returns_catalog() {
    let server = MockServer::start().await;
    let response = router_for(&server)
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"gpt-4o"));
    assert!(ids.contains(&"claude-3-5-sonnet"));
}

#[tokio::test]
async fn image_generation_returns_distinct_urls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chats/stream"))
        .respond_with(NumberedImage { counter: AtomicUsize::new(0) })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/storage/gen/.+"))
        .respond_with(StorageLookup { base: server.uri() })
        .mount(&server)
        .await;

    let response = router_for(&server)
        .oneshot(post_json(
            "/v1/images/generations",
            json!({"prompt": "a red fox", "n": 3, "size": "1024x1024"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let mut urls: Vec<String> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["url"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(urls.len(), 3);
    urls.sort();
    urls.dedup();
    assert_eq!(urls.len(), 3);
    assert!(urls.iter().all(|u| u.starts_with(&format!("{}/cdn/", server.uri()))));
}

#[tokio::test]
async fn image_generation_b64_downloads_images() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chats/stream"))
        .respond_with(NumberedImage { counter: AtomicUsize::new(0) })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/storage/gen/.+"))
        .respond_with(StorageLookup { base: server.uri() })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/cdn/.+"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"png-bytes".to_vec()))
        .mount(&server)
        .await;

    let response = router_for(&server)
        .oneshot(post_json(
            "/v1/images/generations",
            json!({"prompt": "a red fox", "response_format": "B64_JSON"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["b64_json"], general_purpose::STANDARD.encode("png-bytes"));
}

#[tokio::test]
async fn image_generation_without_images_is_insufficient() {
    let server = MockServer::start().await;
    mount_chat_stream(
        &server,
        "data: {\"choices\":[{\"delta\":{\"content\":\"I cannot draw that.\"},\"index\":0}]}\n\ndata: [DONE]\n\n",
    )
    .await;

    let response = router_for(&server)
        .oneshot(post_json("/v1/images/generations", json!({"prompt": "x", "n": 2})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    // 2n 轮，每轮 n 次
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 8);
}

#[tokio::test]
async fn image_generation_validates_input() {
    let server = MockServer::start().await;
    let router = router_for(&server);

    let empty_prompt = router
        .clone()
        .oneshot(post_json("/v1/images/generations", json!({"prompt": "  "})))
        .await
        .unwrap();
    assert_eq!(empty_prompt.status(), StatusCode::BAD_REQUEST);

    let too_many = router
        .oneshot(post_json("/v1/images/generations", json!({"prompt": "cat", "n": 11})))
        .await
        .unwrap();
    assert_eq!(too_many.status(), StatusCode::BAD_REQUEST);
}
