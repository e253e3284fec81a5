use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderValue, Method},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::proxy::client::UpstreamClient;
use crate::proxy::config::GatewayConfig;
use crate::proxy::converter::{
    to_upstream_chat, ChatRequest, ImageGenContext, ImageGenerationRequest, ResponseFormat,
};
use crate::proxy::error::{GatewayError, Result};
use crate::proxy::image_uploader::ImageUploader;
use crate::proxy::model_mapper::ModelMapper;
use crate::proxy::retry_handler::{encode_images, RetryOrchestrator, UpstreamImageAttempt};
use crate::proxy::stream_converter::{
    aggregate_stream, extract_storage_path, rewrite_storage_url, transcode_stream, ChunkFactory,
    ChunkStyle, SseTranscoder, StreamItem, DONE_SENTINEL,
};

/// 单次生图请求允许的最大张数
pub const MAX_IMAGES_PER_REQUEST: u32 = 10;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub client: UpstreamClient,
    pub uploader: ImageUploader,
    pub mapper: Arc<ModelMapper>,
    pub orchestrator: RetryOrchestrator,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let config = Arc::new(config);
        let client = UpstreamClient::new(config.clone())?;
        Ok(Self {
            uploader: ImageUploader::new(client.clone()),
            mapper: Arc::new(ModelMapper::new(config.model_aliases.clone())),
            orchestrator: RetryOrchestrator::new(config.image_concurrency),
            client,
            config,
        })
    }
}

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/healthz", get(health_check))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/images/generations", post(image_generations))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

/// Axum 网关服务
pub struct AxumServer {
    state: AppState,
    cancel: CancellationToken,
}

impl AxumServer {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Ok(Self {
            state: AppState::new(config)?,
            cancel: CancellationToken::new(),
        })
    }

    /// 用于外部触发优雅关闭
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 按配置中的 host/port 监听并运行，直到取消
    pub async fn start(self) -> anyhow::Result<()> {
        let listener =
            TcpListener::bind((self.state.config.host.as_str(), self.state.config.port)).await?;
        self.serve(listener).await
    }

    /// 使用已绑定的监听器运行
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!("网关服务已启动: http://{}", addr);
        tracing::info!("上游: {}", self.state.config.upstream_base);

        let app = build_router(self.state);
        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await?;

        tracing::info!("网关服务已停止");
        Ok(())
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn list_models() -> impl IntoResponse {
    Json(ModelMapper::catalog())
}

/// 解析请求体，失败返回 400
fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("请求体不是合法 JSON: {}", e)))
}

async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let request: ChatRequest = parse_body(&body)?;
    tracing::info!(
        "收到对话请求: model={}, stream={}, messages={}",
        request.model,
        request.stream,
        request.messages.len()
    );

    let converted =
        to_upstream_chat(&request, &state.mapper, &state.uploader, state.config.web_search).await?;
    let factory = ChunkFactory::new(converted.request.model.clone());
    let lines = state.client.stream_chat(&converted.request).await?;

    if request.stream {
        let style = if converted.request.function_web_search {
            ChunkStyle::Synthesized
        } else {
            ChunkStyle::Passthrough
        };
        let items = transcode_stream(lines, SseTranscoder::new(style, factory.clone()));
        let client = state.client.clone();

        // 客户端断开时该流被 drop，上游连接一并关闭
        let events = async_stream::stream! {
            let mut items = Box::pin(items);
            while let Some(item) = items.next().await {
                match item {
                    StreamItem::Chunk(data) | StreamItem::Error(data) => {
                        yield Ok::<Event, Infallible>(Event::default().data(data));
                    }
                    StreamItem::ImageReference { path, markdown } => {
                        let content = match client.resolve_storage(&path).await {
                            Ok(url) => rewrite_storage_url(&markdown, &path, &url),
                            Err(e) => {
                                tracing::warn!("生成图片地址解析失败 {}: {}", path, e);
                                markdown
                            }
                        };
                        yield Ok(Event::default().data(factory.content_chunk(&content).to_string()));
                    }
                    StreamItem::Done => {
                        yield Ok(Event::default().data(DONE_SENTINEL));
                    }
                }
            }
        };

        let mut response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        return Ok(response);
    }

    let aggregate = aggregate_stream(lines).await?;
    if !aggregate.completed {
        tracing::debug!("上游流未以 [DONE] 结束，按已收到内容返回");
    }

    let mut content = aggregate.text();
    if let Some(path) = extract_storage_path(&content) {
        match state.client.resolve_storage(&path).await {
            Ok(url) => content = rewrite_storage_url(&content, &path, &url),
            Err(e) => tracing::warn!("生成图片地址解析失败 {}: {}", path, e),
        }
    }

    let prompt_text = converted
        .request
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let images: &[String] = if converted.has_image { &converted.image_urls } else { &[] };

    Ok(Json(factory.completion(&content, images, &prompt_text)).into_response())
}

async fn image_generations(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let request: ImageGenerationRequest = parse_body(&body)?;

    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(GatewayError::InvalidRequest("prompt 不能为空".to_string()));
    }

    let n = request.n.unwrap_or(1);
    if !(1..=MAX_IMAGES_PER_REQUEST).contains(&n) {
        return Err(GatewayError::InvalidRequest(format!(
            "n 必须在 1 到 {} 之间",
            MAX_IMAGES_PER_REQUEST
        )));
    }

    let format = ResponseFormat::parse(request.response_format.as_deref());
    tracing::info!(
        "收到生图请求: n={}, format={:?}, size={:?}",
        n,
        format,
        request.size
    );

    let context = ImageGenContext::new(state.config.image_source, request.size.as_deref());
    let attempt = Arc::new(UpstreamImageAttempt::new(state.client.clone(), context));
    let urls = state.orchestrator.collect(attempt, &prompt, n as usize).await?;

    let data: Vec<Value> = match format {
        ResponseFormat::Url => urls.into_iter().map(|url| json!({"url": url})).collect(),
        ResponseFormat::B64Json => {
            let client = state.client.clone();
            encode_images(&urls, |url| {
                let client = client.clone();
                async move { client.download(&url).await }
            })
            .await?
            .into_iter()
            .map(|b64| json!({"b64_json": b64}))
            .collect()
        }
    };

    Ok(Json(json!({
        "created": chrono::Utc::now().timestamp(),
        "data": data,
    }))
    .into_response())
}
