// 网关错误类型 - 统一映射为 OpenAI 风格的错误响应

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// 凭据缺失或配置非法，任何签名调用都会失败
    #[error("配置错误: {0}")]
    Config(String),

    /// 客户端请求不合法 (JSON 错误、空消息、空 prompt 等)
    #[error("{0}")]
    InvalidRequest(String),

    /// base64 图片解码失败
    #[error("图片解码失败: {0}")]
    Decode(String),

    /// 连接失败 / 超时
    #[error("上游连接失败: {0}")]
    Transport(String),

    /// 上游返回非 2xx
    #[error("上游返回错误状态 {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// 上游返回了无法识别的响应体
    #[error("上游响应格式错误: {0}")]
    Protocol(String),

    /// 图片生成重试耗尽仍未凑齐
    #[error("仅生成 {collected}/{requested} 张图片")]
    InsufficientResults { requested: usize, collected: usize },
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidRequest(_) | GatewayError::Decode(_) => StatusCode::BAD_REQUEST,
            GatewayError::Transport(_) | GatewayError::Protocol(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamStatus { status, .. } => {
                // 只透传有意义的客户端/服务端错误码
                StatusCode::from_u16(*status)
                    .ok()
                    .filter(|s| s.is_client_error() || s.is_server_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::InsufficientResults { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::Decode(_) => "invalid_request_error",
            GatewayError::Config(_) => "config_error",
            GatewayError::Transport(_) => "upstream_unavailable",
            _ => "api_error",
        }
    }

    /// 返回给客户端的错误描述，传输层细节只留在服务端日志
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Transport(_) => "upstream service unavailable".to_string(),
            GatewayError::Config(_) => "gateway is not configured for signing".to_string(),
            GatewayError::UpstreamStatus { status, .. } => {
                format!("upstream returned status {}", status)
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Transport(format!("请求超时: {}", e))
        } else if e.is_decode() {
            GatewayError::Protocol(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("请求失败: {}", self);
        } else {
            tracing::warn!("请求被拒绝: {}", self);
        }

        let body = json!({
            "error": {
                "message": self.client_message(),
                "type": self.error_type(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}
