use std::sync::OnceLock;

use futures::{Stream, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};

use crate::proxy::client::LineStream;
use crate::proxy::error::{GatewayError, Result};

/// SSE 结束标记
pub const DONE_SENTINEL: &str = "[DONE]";

/// 上游生成图片的 Markdown 中使用的占位域名
pub const STORAGE_HOST_MARKER: &str = "spc.unk";

// ===== 管道中的纯函数 =====

/// 单行解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// 非 `data: ` 行 (注释、event、空行)
    Ignored,
    /// `data: [DONE]`
    Done,
    /// 合法 JSON
    Event(Value),
    /// JSON 解析失败，记录日志后跳过
    Malformed(String),
}

/// 解析一行上游 SSE
pub fn parse_line(line: &str) -> ParsedLine {
    let Some(payload) = line.strip_prefix("data: ") else {
        return ParsedLine::Ignored;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return ParsedLine::Ignored;
    }
    if payload == DONE_SENTINEL {
        return ParsedLine::Done;
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(v) => ParsedLine::Event(v),
        Err(e) => ParsedLine::Malformed(e.to_string()),
    }
}

/// 心跳、统计、操作提示等控制事件
pub fn is_control_event(event: &Value) -> bool {
    if event.get("ping").is_some() {
        return true;
    }
    match event.get("data") {
        Some(data) => {
            data.get("analytics").is_some()
                || (data.get("operation").is_some() && data.get("message").is_some())
        }
        None => false,
    }
}

/// 事件分类
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// 搜索来源，已拼好的 Markdown 片段
    WebSources(String),
    /// 正文增量
    Content(String),
    /// 其他事件，不产生输出
    Other,
}

/// 对单个上游事件分类
pub fn classify(event: &Value) -> EventKind {
    if let Some(sources) = event
        .get("data")
        .and_then(|d| d.get("web"))
        .and_then(|w| w.get("sources"))
        .and_then(|s| s.as_array())
    {
        let fragment = web_sources_fragment(sources);
        return if fragment.is_empty() {
            EventKind::Other
        } else {
            EventKind::WebSources(fragment)
        };
    }

    let Some(choices) = event.get("choices").and_then(|c| c.as_array()) else {
        return EventKind::Other;
    };

    let mut content: Option<String> = None;
    for choice in choices {
        if let Some(piece) = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            content.get_or_insert_with(String::new).push_str(piece);
        }
    }

    match content {
        Some(text) => EventKind::Content(text),
        None => EventKind::Other,
    }
}

/// 每个同时带 title 与 url 的来源生成 `\n### {title}\n{url}\n`，按来源顺序拼接
pub fn web_sources_fragment(sources: &[Value]) -> String {
    sources
        .iter()
        .filter_map(|source| {
            let title = source.get("title").and_then(|t| t.as_str())?;
            let url = source.get("url").and_then(|u| u.as_str())?;
            Some(format!("\n### {}\n{}\n", title, url))
        })
        .collect()
}

fn storage_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[.*?\]\(https://spc\.unk/(.*?)\)").expect("valid storage regex"))
}

/// 从 Markdown 中提取 `![...](https://spc.unk/<path>)` 的 path
pub fn extract_storage_path(markdown: &str) -> Option<String> {
    storage_regex()
        .captures(markdown)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|p| !p.is_empty())
}

/// 把正文中的占位存储地址替换为真实地址
pub fn rewrite_storage_url(markdown: &str, path: &str, resolved: &str) -> String {
    markdown.replace(&format!("https://{}/{}", STORAGE_HOST_MARKER, path), resolved)
}

/// 生成图片 Markdown 在一段增量中的起始位置
///
/// 优先匹配 `\n\n![`，否则取占位域名之前最近的 `![`
fn image_markdown_start(text: &str) -> Option<usize> {
    if let Some(pos) = text.find("\n\n![") {
        return Some(pos);
    }
    let marker = text.find(STORAGE_HOST_MARKER)?;
    Some(text[..marker].rfind("![").unwrap_or(0))
}

// ===== OpenAI chunk 构造 =====

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn new_fingerprint() -> String {
    let mut rng = rand::thread_rng();
    let hex: String = (0..12)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect();
    format!("fp_{}", hex)
}

/// 合成 OpenAI chunk / completion 的工厂，同一个响应共享 model 与 fingerprint
#[derive(Debug, Clone)]
pub struct ChunkFactory {
    model: String,
    system_fingerprint: String,
}

impl ChunkFactory {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_fingerprint: new_fingerprint(),
        }
    }

    /// 单个 `chat.completion.chunk`，每次调用生成新的 id
    pub fn content_chunk(&self, content: &str) -> Value {
        json!({
            "id": format!("chatcmpl-{}", random_alphanumeric(24)),
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": {"content": content},
                "finish_reason": null
            }],
            "system_fingerprint": self.system_fingerprint,
        })
    }

    /// 非流式 `chat.completion`
    ///
    /// # 参数
    /// - `content`: 聚合后的正文
    /// - `images`: 请求中携带的图片地址，非空时回显在 assistant 消息上
    /// - `prompt_text`: 用于估算 prompt_tokens 的请求文本
    pub fn completion(&self, content: &str, images: &[String], prompt_text: &str) -> Value {
        let prompt_tokens = estimate_tokens(prompt_text);
        let completion_tokens = estimate_tokens(content);

        let mut message = json!({
            "role": "assistant",
            "content": content,
            "refusal": null,
        });
        if !images.is_empty() {
            message["images"] = json!(images);
        }

        json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "logprobs": null,
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": prompt_tokens,
                "completion_tokens": completion_tokens,
                "total_tokens": prompt_tokens + completion_tokens,
                "prompt_tokens_details": {"cached_tokens": 0, "audio_tokens": 0},
                "completion_tokens_details": {
                    "reasoning_tokens": 0,
                    "audio_tokens": 0,
                    "accepted_prediction_tokens": 0,
                    "rejected_prediction_tokens": 0
                }
            },
            "system_fingerprint": self.system_fingerprint,
        })
    }
}

/// 按空白切分的粗略 token 数
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

// ===== 流式转码 =====

/// 流式 chunk 的输出形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStyle {
    /// 原样转发上游 JSON
    Passthrough,
    /// 合成 OpenAI chunk
    Synthesized,
}

/// 转码器对外输出
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// 一个 SSE data 负载 (JSON 字符串)
    Chunk(String),
    /// 正文中出现了生成图片
    ///
    /// 网关解析 `path` 后把 `markdown` 中的占位地址替换为真实地址再补发
    ImageReference { path: String, markdown: String },
    /// 终止标记
    Done,
    /// 传输失败，携带错误事件 JSON
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeState {
    Streaming,
    Done,
    Error,
}

/// 流式转码状态机: STREAMING -> DONE | ERROR
pub struct SseTranscoder {
    style: ChunkStyle,
    factory: ChunkFactory,
    state: TranscodeState,
    /// 从生成图片 Markdown 开始到流结束的全部正文，到 [DONE] 时统一处理
    image_buffer: Option<String>,
}

impl SseTranscoder {
    pub fn new(style: ChunkStyle, factory: ChunkFactory) -> Self {
        Self {
            style,
            factory,
            state: TranscodeState::Streaming,
            image_buffer: None,
        }
    }

    pub fn state(&self) -> TranscodeState {
        self.state
    }

    /// 处理一行上游输出
    pub fn push_line(&mut self, line: &str) -> Vec<StreamItem> {
        if self.state != TranscodeState::Streaming {
            return Vec::new();
        }

        let event = match parse_line(line) {
            ParsedLine::Ignored => return Vec::new(),
            ParsedLine::Done => return self.complete(),
            ParsedLine::Malformed(e) => {
                tracing::warn!("跳过无法解析的 SSE 帧: {} ({})", truncate_line(line), e);
                return Vec::new();
            }
            ParsedLine::Event(v) => v,
        };

        if is_control_event(&event) {
            return Vec::new();
        }

        match classify(&event) {
            EventKind::WebSources(fragment) => {
                vec![StreamItem::Chunk(self.factory.content_chunk(&fragment).to_string())]
            }
            EventKind::Content(text) => {
                if let Some(buffer) = self.image_buffer.as_mut() {
                    buffer.push_str(&text);
                    return Vec::new();
                }
                if let Some(start) = image_markdown_start(&text) {
                    tracing::debug!("检测到生成图片输出，开始缓冲");
                    let (before, image) = text.split_at(start);
                    self.image_buffer = Some(image.to_string());
                    // 图片之前的正文照常输出，截断后的增量只能合成 chunk
                    return if before.is_empty() {
                        Vec::new()
                    } else {
                        vec![StreamItem::Chunk(self.factory.content_chunk(before).to_string())]
                    };
                }
                match self.style {
                    ChunkStyle::Passthrough => vec![StreamItem::Chunk(event.to_string())],
                    ChunkStyle::Synthesized => {
                        vec![StreamItem::Chunk(self.factory.content_chunk(&text).to_string())]
                    }
                }
            }
            EventKind::Other => Vec::new(),
        }
    }

    /// 上游流结束但没有收到 [DONE]
    pub fn finish(&mut self) -> Vec<StreamItem> {
        if self.state != TranscodeState::Streaming {
            return Vec::new();
        }
        tracing::debug!("上游流结束时未收到 [DONE]，补发结束标记");
        self.complete()
    }

    /// 传输层失败，输出一个错误事件并终止
    pub fn fail(&mut self, error: &GatewayError) -> Vec<StreamItem> {
        if self.state != TranscodeState::Streaming {
            return Vec::new();
        }
        self.state = TranscodeState::Error;
        tracing::error!("上游流中断: {}", error);

        let event = json!({
            "error": {
                "message": format!("upstream stream interrupted: {}", error.client_message()),
                "type": "upstream_error",
            }
        });
        vec![StreamItem::Error(event.to_string())]
    }

    fn complete(&mut self) -> Vec<StreamItem> {
        self.state = TranscodeState::Done;
        let mut items = Vec::new();

        if let Some(buffer) = self.image_buffer.take() {
            match extract_storage_path(&buffer) {
                Some(path) => items.push(StreamItem::ImageReference { path, markdown: buffer }),
                // 不是存储图片，原样补发
                None => items.push(StreamItem::Chunk(self.factory.content_chunk(&buffer).to_string())),
            }
        }

        items.push(StreamItem::Done);
        items
    }
}

fn truncate_line(line: &str) -> String {
    line.chars().take(120).collect()
}

/// 将上游行流转为转码后的输出流
///
/// 客户端断开时输出流被 drop，上游连接随之关闭
pub fn transcode_stream(
    mut lines: LineStream,
    mut transcoder: SseTranscoder,
) -> impl Stream<Item = StreamItem> + Send + 'static {
    async_stream::stream! {
        'outer: loop {
            match lines.next().await {
                Some(Ok(line)) => {
                    for item in transcoder.push_line(&line) {
                        yield item;
                    }
                    if transcoder.state() != TranscodeState::Streaming {
                        break 'outer;
                    }
                }
                Some(Err(e)) => {
                    for item in transcoder.fail(&e) {
                        yield item;
                    }
                    break 'outer;
                }
                None => {
                    for item in transcoder.finish() {
                        yield item;
                    }
                    break 'outer;
                }
            }
        }
    }
}

// ===== 聚合模式 =====

/// 聚合结果中的一段，保持到达顺序
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Source(String),
    Content(String),
}

/// 聚合模式的输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregate {
    pub segments: Vec<Segment>,
    /// 是否收到了 [DONE]
    pub completed: bool,
}

impl Aggregate {
    /// 来源片段与正文按到达顺序拼接
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Source(t) | Segment::Content(t) => t.as_str(),
            })
            .collect()
    }
}

/// 聚合器，逐行累积
#[derive(Debug, Default)]
pub struct Aggregator {
    aggregate: Aggregate,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 处理一行，返回 true 表示已收到 [DONE]
    pub fn push_line(&mut self, line: &str) -> bool {
        if self.aggregate.completed {
            return true;
        }

        match parse_line(line) {
            ParsedLine::Ignored => {}
            ParsedLine::Done => self.aggregate.completed = true,
            ParsedLine::Malformed(e) => {
                tracing::warn!("跳过无法解析的 SSE 帧: {} ({})", truncate_line(line), e);
            }
            ParsedLine::Event(event) => {
                if is_control_event(&event) {
                    return false;
                }
                match classify(&event) {
                    EventKind::WebSources(fragment) => {
                        self.aggregate.segments.push(Segment::Source(fragment))
                    }
                    EventKind::Content(text) if !text.is_empty() => {
                        self.aggregate.segments.push(Segment::Content(text))
                    }
                    _ => {}
                }
            }
        }
        self.aggregate.completed
    }

    pub fn finish(self) -> Aggregate {
        self.aggregate
    }
}

/// 消费整个上游流并聚合
///
/// 中途传输失败时整个请求失败
pub async fn aggregate_stream(mut lines: LineStream) -> Result<Aggregate> {
    let mut aggregator = Aggregator::new();
    while let Some(line) = lines.next().await {
        if aggregator.push_line(&line?) {
            break;
        }
    }
    Ok(aggregator.finish())
}
