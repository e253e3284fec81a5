// 上游 HTTP 客户端 - 负责签名头、流式对话、存储查询与图片下载

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE, DATE, USER_AGENT,
};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio_util::io::StreamReader;

use crate::proxy::config::GatewayConfig;
use crate::proxy::converter::UpstreamChatRequest;
use crate::proxy::error::{GatewayError, Result};
use crate::proxy::token_signer::TokenSigner;

/// 上游对话流路径
pub const CHAT_STREAM_PATH: &str = "/chats/stream";
/// 上游图片上传路径
pub const UPLOAD_PATH: &str = "/storage/upload";

/// 单行上限，超过的行整行跳过
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// 上游 SSE 原始行流
pub type LineStream = BoxStream<'static, Result<String>>;

/// 存储接口返回体
#[derive(Debug, Deserialize)]
struct StorageResponse {
    #[serde(rename = "getUrl")]
    get_url: Option<String>,
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    signer: TokenSigner,
    config: Arc<GatewayConfig>,
}

impl UpstreamClient {
    pub fn new(config: Arc<GatewayConfig>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| GatewayError::Config(format!("无法创建 HTTP 客户端: {}", e)))?;

        let signer = TokenSigner::new(config.credential.clone())
            .with_header_logging(config.log_auth_headers);

        Ok(Self { http, signer, config })
    }

    /// 生成一组带签名的上游请求头
    ///
    /// 时间戳只生成一次，Date 头与签名使用同一个值
    fn signed_headers(&self, body: &[u8], path: &str, method: &str) -> Result<HeaderMap> {
        let timestamp = TokenSigner::current_timestamp();
        let token = self.signer.sign(body, path, method, &timestamp)?;

        let mut headers = HeaderMap::new();
        headers.insert(DATE, header_value(&timestamp)?);
        headers.insert("client-time-zone", header_value(&self.config.client_time_zone)?);
        headers.insert(AUTHORIZATION, header_value(&token)?);
        headers.insert(USER_AGENT, header_value(&self.config.user_agent)?);
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US"));
        headers.insert("x-cl-options", HeaderValue::from_static("hb"));
        Ok(headers)
    }

    /// 发起流式对话，返回按行切分的上游 SSE 流
    ///
    /// 请求体只序列化一次，签名与发送使用同一份字节。
    /// 返回的流被 drop 时底层连接随之关闭。
    pub async fn stream_chat(&self, request: &UpstreamChatRequest) -> Result<LineStream> {
        let body = serde_json::to_vec(request)
            .map_err(|e| GatewayError::InvalidRequest(format!("无法序列化上游请求: {}", e)))?;
        let mut headers = self.signed_headers(&body, CHAT_STREAM_PATH, "POST")?;
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=UTF-8"),
        );

        let url = self.config.endpoint(CHAT_STREAM_PATH)?;
        tracing::debug!(
            "发送上游对话请求: model={}, source={}, messages={}",
            request.model,
            request.source.as_str(),
            request.messages.len()
        );

        let response = self.http.post(url).headers(headers).body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("上游对话返回 {}: {}", status, truncate(&body, 300));
            return Err(GatewayError::UpstreamStatus { status: status.as_u16(), body });
        }

        let reader = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        Ok(split_lines(reader, MAX_LINE_LENGTH))
    }

    /// 上传一个文件到上游存储，返回 getUrl
    ///
    /// 上传签名固定对空 body 计算
    pub async fn upload_file(&self, bytes: Vec<u8>, file_name: String, mime: &str) -> Result<String> {
        let headers = self.signed_headers(&[], UPLOAD_PATH, "POST")?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| GatewayError::InvalidRequest(format!("非法的 MIME 类型 {}: {}", mime, e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.config.endpoint(UPLOAD_PATH)?)
            .headers(headers)
            .multipart(form)
            .timeout(self.config.upload_timeout)
            .send()
            .await?;

        Self::read_get_url(response).await
    }

    /// 把 `spc.unk` 存储路径解析为最终下载地址
    pub async fn resolve_storage(&self, path: &str) -> Result<String> {
        let url = self.config.endpoint(&format!("/storage/{}", path.trim_start_matches('/')))?;
        let response = self
            .http
            .get(url)
            .timeout(self.config.storage_timeout)
            .send()
            .await?;

        Self::read_get_url(response).await
    }

    /// 下载图片原始字节
    pub async fn download(&self, url: &str) -> Result<Bytes> {
        let response = self
            .http
            .get(url)
            .timeout(self.config.download_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                body: format!("下载图片失败: {}", url),
            });
        }
        Ok(response.bytes().await?)
    }

    async fn read_get_url(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::UpstreamStatus { status: status.as_u16(), body: text });
        }

        let parsed: StorageResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Protocol(format!("存储接口返回非 JSON: {}", e)))?;
        parsed
            .get_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| GatewayError::Protocol("存储接口响应缺少 getUrl".to_string()))
    }
}

/// 单次按行读取的结果
enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// 读取一行到 `buf`，最多保留 `max_length` 字节
///
/// 超长时丢弃到下一个换行为止
async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_length: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max_length as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') || (n as u64) < limit {
        return Ok(LineRead::Line);
    }

    loop {
        buf.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        if n == 0 || buf.last() == Some(&b'\n') {
            buf.clear();
            return Ok(LineRead::TooLong);
        }
    }
}

/// 按原始字节把上游响应切分为行
///
/// 非法 UTF-8 或超长的行记录日志后跳过，只有读取失败才结束流。
/// 行尾的 `\n` / `\r\n` 会被去掉。
fn split_lines<R>(reader: R, max_length: usize) -> LineStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async_stream::stream! {
        let mut reader = reader;
        let mut buf: Vec<u8> = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match read_line_bounded(&mut reader, &mut buf, max_length).await {
                Ok(LineRead::Eof) => break,
                Ok(LineRead::TooLong) => {
                    tracing::warn!("跳过超过 {} 字节的上游行", max_length);
                }
                Ok(LineRead::Line) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    match std::str::from_utf8(&buf) {
                        Ok(line) => {
                            yield Ok(line.to_string());
                        }
                        Err(e) => tracing::warn!("跳过非 UTF-8 的上游行: {}", e),
                    }
                }
                Err(e) => {
                    yield Err(GatewayError::Transport(e.to_string()));
                    break;
                }
            }
        }
    }
    .boxed()
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| GatewayError::Config(format!("请求头包含非法字符: {}", truncate(value, 40))))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
