use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::proxy::config::Credential;
use crate::proxy::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Date 头与签名共用的时间格式 (UTC, 秒精度)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Bearer Token 签名器
///
/// 规范串: `{method}:{path}:{timestamp}\n{body}`
/// Token: `Bearer base64(key_a).base64(HMAC-SHA256(key_b, 规范串))`
#[derive(Debug, Clone)]
pub struct TokenSigner {
    credential: Credential,
    /// 是否打印生成的 Authorization 头
    log_headers: bool,
}

impl TokenSigner {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            log_headers: false,
        }
    }

    /// 打开调试日志 (会输出完整 Authorization 头，生产环境不要打开)
    pub fn with_header_logging(mut self, enabled: bool) -> Self {
        self.log_headers = enabled;
        self
    }

    /// 当前 UTC 时间，格式 `YYYY-MM-DDThh:mm:ssZ`
    ///
    /// 每个上游请求只调用一次，结果同时用于 Date 头和签名
    pub fn current_timestamp() -> String {
        chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
    }

    /// 生成 Authorization 头
    ///
    /// # 参数
    /// - `body`: 实际发送的请求体字节
    /// - `path`: 上游路径，如 `/chats/stream`
    /// - `method`: HTTP 方法，如 `POST`
    /// - `timestamp`: 与 Date 头一致的时间戳
    ///
    /// # 返回
    /// - Ok(String): `Bearer ...`
    /// - Err(GatewayError::Config): 任一密钥为空
    pub fn sign(&self, body: &[u8], path: &str, method: &str, timestamp: &str) -> Result<String> {
        if !self.credential.is_complete() {
            return Err(GatewayError::Config("KEY_A 或 KEY_B 为空，无法签名".to_string()));
        }

        let mut canonical = Vec::with_capacity(method.len() + path.len() + timestamp.len() + body.len() + 3);
        canonical.extend_from_slice(method.as_bytes());
        canonical.push(b':');
        canonical.extend_from_slice(path.as_bytes());
        canonical.push(b':');
        canonical.extend_from_slice(timestamp.as_bytes());
        canonical.push(b'\n');
        canonical.extend_from_slice(body);

        let mut mac = HmacSha256::new_from_slice(&self.credential.key_b)
            .map_err(|e| GatewayError::Config(format!("HMAC 密钥非法: {}", e)))?;
        mac.update(&canonical);
        let signature = mac.finalize().into_bytes();

        let token = format!(
            "Bearer {}.{}",
            general_purpose::STANDARD.encode(&self.credential.key_a),
            general_purpose::STANDARD.encode(signature)
        );

        if self.log_headers {
            tracing::debug!("[{} {}] Date: {} Authorization: {}", method, path, timestamp, token);
        }

        Ok(token)
    }
}
