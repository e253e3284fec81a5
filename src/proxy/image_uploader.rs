use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};

use crate::proxy::client::UpstreamClient;
use crate::proxy::converter::ImageStore;
use crate::proxy::error::{GatewayError, Result};

/// 内联图片上传器
///
/// 把 base64 图片解码后以 multipart 上传到上游存储，返回可访问的 getUrl
#[derive(Clone)]
pub struct ImageUploader {
    client: UpstreamClient,
}

impl ImageUploader {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }

    /// 解码 base64 图片，接受可选的 `data:image/...;base64,` 前缀
    ///
    /// # 返回
    /// - Err(GatewayError::Decode): payload 不是合法 base64 或解码后为空
    pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
        let raw = match payload.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => payload,
        };

        // 部分客户端会在 base64 中夹带换行
        let cleaned: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = general_purpose::STANDARD
            .decode(cleaned.as_bytes())
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        if bytes.is_empty() {
            return Err(GatewayError::Decode("图片内容为空".to_string()));
        }
        Ok(bytes)
    }

    fn random_file_name() -> String {
        format!("{}.jpg", uuid::Uuid::new_v4().simple())
    }
}

#[async_trait]
impl ImageStore for ImageUploader {
    async fn upload(&self, payload: &str) -> Result<String> {
        // 解码失败不会发起任何网络请求
        let bytes = Self::decode_payload(payload)?;
        let file_name = Self::random_file_name();
        tracing::debug!("上传图片 {} ({} 字节)", file_name, bytes.len());

        let url = self.client.upload_file(bytes, file_name, "image/jpeg").await?;
        tracing::info!("图片上传成功: {}", url);
        Ok(url)
    }
}
