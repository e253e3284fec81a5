use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use url::Url;

use crate::proxy::converter::ChatSource;
use crate::proxy::error::{GatewayError, Result};

/// 默认上游地址
pub const DEFAULT_UPSTREAM_BASE: &str = "https://api.chaton.ai";

/// 默认 User-Agent (Android 客户端)
pub const DEFAULT_USER_AGENT: &str = "ChatOn_Android/1.53.502";

/// 签名密钥对
///
/// `key_a` 以 base64 形式直接出现在 Authorization 头中，
/// `key_b` 作为 HMAC-SHA256 的密钥
#[derive(Clone, Default)]
pub struct Credential {
    pub key_a: Vec<u8>,
    pub key_b: Vec<u8>,
}

impl Credential {
    pub fn new(key_a: impl Into<Vec<u8>>, key_b: impl Into<Vec<u8>>) -> Self {
        Self {
            key_a: key_a.into(),
            key_b: key_b.into(),
        }
    }

    /// 两个密钥都非空才能签名
    pub fn is_complete(&self) -> bool {
        !self.key_a.is_empty() && !self.key_b.is_empty()
    }
}

// 密钥永远不进日志
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key_a", &if self.key_a.is_empty() { "<empty>" } else { "<redacted>" })
            .field("key_b", &if self.key_b.is_empty() { "<empty>" } else { "<redacted>" })
            .finish()
    }
}

/// 网关配置
/// 进程启动时从环境变量加载一次，之后只读
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub credential: Credential,
    pub user_agent: String,
    pub upstream_base: Url,
    /// `Client-time-zone` 请求头
    pub client_time_zone: String,
    /// 图片生成并发上限
    pub image_concurrency: usize,
    /// 图片生成使用的 source
    pub image_source: ChatSource,
    pub upload_timeout: Duration,
    pub storage_timeout: Duration,
    pub download_timeout: Duration,
    /// 是否在日志中打印生成的 Authorization 头 (仅用于调试)
    pub log_auth_headers: bool,
    /// 对话请求是否开启上游联网搜索，关闭时流式 chunk 原样转发
    pub web_search: bool,
    /// 自定义模型别名，格式 `alias=model,alias2=model2`
    pub model_aliases: HashMap<String, String>,
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            credential: Credential::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            // 常量地址，解析不会失败
            upstream_base: Url::parse(DEFAULT_UPSTREAM_BASE).expect("valid default upstream url"),
            client_time_zone: "-05:00".to_string(),
            image_concurrency: 10,
            image_source: ChatSource::Free,
            upload_timeout: Duration::from_secs(10),
            storage_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(30),
            log_auth_headers: false,
            web_search: true,
            model_aliases: HashMap::new(),
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl GatewayConfig {
    /// 从进程环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意 key -> value 查找函数加载配置
    ///
    /// # 参数
    /// - `lookup`: 环境变量查找函数，返回 None 表示未设置
    ///
    /// # 返回
    /// - Err(GatewayError::Config): 数值或 URL 非法
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let credential = Credential::new(
            get("KEY_A").unwrap_or_default(),
            get("KEY_B").unwrap_or_default(),
        );
        if !credential.is_complete() {
            tracing::warn!("KEY_A / KEY_B 未设置，所有需要签名的请求都会失败");
        }

        let upstream_base = match get("UPSTREAM_BASE_URL") {
            Some(raw) => Url::parse(&raw)
                .map_err(|e| GatewayError::Config(format!("UPSTREAM_BASE_URL 非法: {}", e)))?,
            None => defaults.upstream_base,
        };

        let image_source = match get("IMAGE_SOURCE").as_deref() {
            None | Some("free") => ChatSource::Free,
            Some("pro_image") => ChatSource::ProImage,
            Some(other) => {
                return Err(GatewayError::Config(format!(
                    "IMAGE_SOURCE 只能是 free 或 pro_image, 实际为 {}",
                    other
                )))
            }
        };

        let image_concurrency = parse_number(&get, "IMAGE_CONCURRENCY", defaults.image_concurrency)?;
        if image_concurrency == 0 {
            return Err(GatewayError::Config("IMAGE_CONCURRENCY 必须大于 0".to_string()));
        }

        Ok(Self {
            credential,
            user_agent: get("USER_AGENT").unwrap_or(defaults.user_agent),
            upstream_base,
            client_time_zone: get("CLIENT_TIME_ZONE").unwrap_or(defaults.client_time_zone),
            image_concurrency,
            image_source,
            upload_timeout: parse_secs(&get, "UPLOAD_TIMEOUT_SECS", defaults.upload_timeout)?,
            storage_timeout: parse_secs(&get, "STORAGE_TIMEOUT_SECS", defaults.storage_timeout)?,
            download_timeout: parse_secs(&get, "DOWNLOAD_TIMEOUT_SECS", defaults.download_timeout)?,
            log_auth_headers: get("LOG_AUTH_HEADERS")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            web_search: get("ENABLE_WEB_SEARCH")
                .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(true),
            model_aliases: get("MODEL_ALIASES")
                .map(|raw| parse_aliases(&raw))
                .transpose()?
                .unwrap_or_default(),
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_number(&get, "PORT", defaults.port)?,
        })
    }

    /// 拼接上游路径，如 `/chats/stream`
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.upstream_base
            .join(path)
            .map_err(|e| GatewayError::Config(format!("无法拼接上游地址 {}: {}", path, e)))
    }
}

/// 解析 `alias=model,alias2=model2`
fn parse_aliases(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((alias, model)) if !alias.trim().is_empty() && !model.trim().is_empty() => {
                Ok((alias.trim().to_string(), model.trim().to_string()))
            }
            _ => Err(GatewayError::Config(format!("MODEL_ALIASES 条目非法: {}", pair))),
        })
        .collect()
}

fn parse_number<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| GatewayError::Config(format!("{} 不是合法数字: {}", key, raw))),
        None => Ok(default),
    }
}

fn parse_secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_number(get, key, default.as_secs()).map(Duration::from_secs)
}
