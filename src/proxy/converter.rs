use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::proxy::error::{GatewayError, Result};
use crate::proxy::model_mapper::ModelMapper;

/// 对话请求默认 max_tokens
pub const DEFAULT_MAX_TOKENS: u32 = 8000;

/// 生图请求的固定系统提示
const IMAGE_SYSTEM_PROMPT: &str = "Your role is that of a smart and creative assistant. Do not mention that you are a chatbot or AI assistant. Consider the terms when communicating: 1. The length of your response: Auto. 2. The tone style of your speech: Default. This dialog box has an option to generate images. The function should be called only when the user explicitly requests it - for example, using any related words associated with image generation requests. In other cases - the call of the image generation function should not be called.";

// ===== OpenAI 格式定义 =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// 多段内容中的单个片段，未知 type 直接解析失败
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Array(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

fn default_model() -> String {
    crate::proxy::model_mapper::DEFAULT_MODEL.to_string()
}

/// 生图结果的返回形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Url,
    B64Json,
}

impl ResponseFormat {
    /// 只有 `b64_json` (忽略大小写) 返回 base64，其余一律返回 url
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(v) if v.trim().eq_ignore_ascii_case("b64_json") => ResponseFormat::B64Json,
            _ => ResponseFormat::Url,
        }
    }
}

// ===== 上游格式定义 =====

/// 上游 `source` 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatSource {
    #[serde(rename = "chat/free")]
    Free,
    #[serde(rename = "chat/pro")]
    Pro,
    #[serde(rename = "chat/pro_image")]
    ProImage,
}

impl ChatSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatSource::Free => "chat/free",
            ChatSource::Pro => "chat/pro",
            ChatSource::ProImage => "chat/pro_image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamImage {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<UpstreamImage>,
}

impl UpstreamMessage {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamChatRequest {
    pub function_image_gen: bool,
    pub function_web_search: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_style: Option<String>,
    pub max_tokens: u32,
    pub messages: Vec<UpstreamMessage>,
    pub model: String,
    pub source: ChatSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_engine: Option<String>,
}

/// 转换结果
#[derive(Debug, Clone)]
pub struct ConvertedChat {
    pub request: UpstreamChatRequest,
    pub has_image: bool,
    pub has_text: bool,
    /// 已上传 / 透传的图片地址，按出现顺序
    pub image_urls: Vec<String>,
}

// ===== 归一化 =====

/// 消息中的图片引用
#[derive(Debug, Clone, PartialEq)]
pub enum ImageRef {
    /// 已经是可访问的地址
    Hosted(String),
    /// `data:image/...;base64,` 内联图片，需要先上传
    Inline(String),
}

impl ImageRef {
    fn classify(url: &str) -> Option<Self> {
        let url = url.trim();
        if url.is_empty() {
            None
        } else if url.starts_with("data:image/") {
            Some(ImageRef::Inline(url.to_string()))
        } else {
            Some(ImageRef::Hosted(url.to_string()))
        }
    }
}

/// 归一化后的单条消息
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub role: String,
    pub text: String,
    pub images: Vec<ImageRef>,
}

impl NormalizedMessage {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.images.is_empty()
    }
}

/// 归一化单条消息内容
///
/// 文本段以单个空格拼接后 trim，空消息返回 None
pub fn normalize_message(message: &ChatMessage) -> Option<NormalizedMessage> {
    let normalized = match &message.content {
        MessageContent::Text(s) => NormalizedMessage {
            role: message.role.clone(),
            text: s.trim().to_string(),
            images: Vec::new(),
        },
        MessageContent::Array(parts) => {
            let mut texts = Vec::new();
            let mut images = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => texts.push(text.as_str()),
                    ContentPart::ImageUrl { image_url } => {
                        images.extend(ImageRef::classify(&image_url.url));
                    }
                }
            }
            NormalizedMessage {
                role: message.role.clone(),
                text: texts.join(" ").trim().to_string(),
                images,
            }
        }
    };

    (!normalized.is_empty()).then_some(normalized)
}

/// 按原顺序归一化全部消息，丢弃空消息
pub fn normalize(messages: &[ChatMessage]) -> Vec<NormalizedMessage> {
    messages.iter().filter_map(normalize_message).collect()
}

/// 内联图片存储接口
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// 上传 base64 图片，返回可访问地址
    async fn upload(&self, payload: &str) -> Result<String>;
}

/// 将客户端对话请求转换为上游请求
///
/// # 参数
/// - `request`: 客户端请求
/// - `mapper`: 模型映射器
/// - `store`: 内联图片上传器，单张上传失败只丢弃该图片
/// - `web_search`: 是否开启上游联网搜索
///
/// # 返回
/// - Ok(ConvertedChat): 上游请求及是否含图片 / 文本
/// - Err(GatewayError::InvalidRequest): 归一化后没有任何消息
pub async fn to_upstream_chat(
    request: &ChatRequest,
    mapper: &ModelMapper,
    store: &dyn ImageStore,
    web_search: bool,
) -> Result<ConvertedChat> {
    let mut messages = Vec::new();
    let mut image_urls = Vec::new();

    for normalized in normalize(&request.messages) {
        let mut images = Vec::with_capacity(normalized.images.len());
        for image in normalized.images {
            match image {
                ImageRef::Hosted(url) => images.push(url),
                ImageRef::Inline(data) => match store.upload(&data).await {
                    Ok(url) => {
                        tracing::debug!("内联图片已上传: {}", url);
                        images.push(url);
                    }
                    Err(e) => tracing::warn!("图片上传失败，已忽略该图片: {}", e),
                },
            }
        }

        if normalized.text.is_empty() && images.is_empty() {
            continue;
        }

        image_urls.extend(images.iter().cloned());
        messages.push(UpstreamMessage {
            role: normalized.role,
            content: normalized.text,
            images: images.into_iter().map(|data| UpstreamImage { data }).collect(),
        });
    }

    if messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages 中没有任何有效内容 (no content)".to_string(),
        ));
    }

    let has_text = messages.iter().any(|m| !m.content.is_empty());
    let has_image = !image_urls.is_empty();

    Ok(ConvertedChat {
        request: UpstreamChatRequest {
            function_image_gen: false,
            function_web_search: web_search,
            image_aspect_ratio: None,
            image_style: None,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            model: mapper.map_model_name(&request.model),
            source: ChatSource::Pro,
            temperature: request.temperature,
            top_p: request.top_p,
            web_search_engine: web_search.then(|| "auto".to_string()),
        },
        has_image,
        has_text,
        image_urls,
    })
}

/// 生图请求的附加参数
#[derive(Debug, Clone)]
pub struct ImageGenContext {
    pub source: ChatSource,
    pub aspect_ratio: String,
}

impl ImageGenContext {
    pub fn new(source: ChatSource, size: Option<&str>) -> Self {
        Self {
            source,
            aspect_ratio: aspect_ratio_for_size(size).to_string(),
        }
    }
}

/// OpenAI 尺寸映射为上游画幅比例
pub fn aspect_ratio_for_size(size: Option<&str>) -> &'static str {
    match size.map(str::trim) {
        Some("1792x1024") => "16:9",
        Some("1024x1792") => "9:16",
        _ => "1:1",
    }
}

/// 构造生图请求：固定系统提示 + `Draw: {prompt}`
///
/// 空 prompt 由调用方提前拒绝
pub fn to_upstream_image_gen(prompt: &str, context: &ImageGenContext) -> UpstreamChatRequest {
    UpstreamChatRequest {
        function_image_gen: true,
        function_web_search: true,
        image_aspect_ratio: Some(context.aspect_ratio.clone()),
        image_style: Some("photographic".to_string()),
        max_tokens: DEFAULT_MAX_TOKENS,
        messages: vec![
            UpstreamMessage::text("system", IMAGE_SYSTEM_PROMPT),
            UpstreamMessage::text("user", &format!("Draw: {}", prompt.trim())),
        ],
        model: crate::proxy::model_mapper::DEFAULT_MODEL.to_string(),
        source: context.source,
        temperature: None,
        top_p: None,
        web_search_engine: Some("auto".to_string()),
    }
}
