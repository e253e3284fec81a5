// 生图重试编排 - 在并发上限内反复尝试，直到凑齐 n 张不同的图片或轮次耗尽

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use base64::{engine::general_purpose, Engine as _};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::proxy::client::UpstreamClient;
use crate::proxy::converter::{to_upstream_image_gen, ImageGenContext};
use crate::proxy::error::{GatewayError, Result};
use crate::proxy::stream_converter::{aggregate_stream, extract_storage_path};

/// 单次生图尝试
#[async_trait]
pub trait ImageAttempt: Send + Sync + 'static {
    /// 成功返回最终下载地址
    async fn attempt(&self, attempt_number: usize, prompt: &str) -> Result<String>;
}

/// 走上游对话流的生图尝试
///
/// 签名请求 -> 聚合 Markdown -> 提取 `spc.unk` 路径 -> 存储查询
pub struct UpstreamImageAttempt {
    client: UpstreamClient,
    context: ImageGenContext,
}

impl UpstreamImageAttempt {
    pub fn new(client: UpstreamClient, context: ImageGenContext) -> Self {
        Self { client, context }
    }
}

#[async_trait]
impl ImageAttempt for UpstreamImageAttempt {
    async fn attempt(&self, attempt_number: usize, prompt: &str) -> Result<String> {
        let request = to_upstream_image_gen(prompt, &self.context);
        let lines = self.client.stream_chat(&request).await?;
        let aggregate = aggregate_stream(lines).await?;

        let markdown = aggregate.text();
        let path = extract_storage_path(&markdown).ok_or_else(|| {
            GatewayError::Protocol(format!("第 {} 次尝试的响应中没有图片", attempt_number))
        })?;

        let url = self.client.resolve_storage(&path).await?;
        tracing::debug!("第 {} 次尝试得到图片: {}", attempt_number, url);
        Ok(url)
    }
}

/// 生图重试编排器
///
/// 信号量在所有请求之间共享，限制同时在途的上游尝试数
#[derive(Clone)]
pub struct RetryOrchestrator {
    semaphore: Arc<Semaphore>,
}

impl RetryOrchestrator {
    /// # 参数
    /// - `max_in_flight`: 同时在途的尝试上限
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// 默认并发上限 10
    pub fn with_defaults() -> Self {
        Self::new(10)
    }

    /// 最大轮次: 2n
    pub fn max_rounds(n: usize) -> usize {
        n * 2
    }

    /// 收集 n 张不同的图片地址
    ///
    /// 每轮并发发起 `n - 已收集` 次尝试，一轮全部结束后再判断是否凑齐。
    /// 单次失败只记录日志，不补齐重复图片。
    ///
    /// # 返回
    /// - Ok(Vec<String>): 恰好 n 个不同地址
    /// - Err(GatewayError::InsufficientResults): 轮次耗尽仍不足 n
    pub async fn collect(
        &self,
        attempt: Arc<dyn ImageAttempt>,
        prompt: &str,
        n: usize,
    ) -> Result<Vec<String>> {
        let mut collected: Vec<String> = Vec::with_capacity(n);
        let mut attempt_number = 0usize;

        for round in 1..=Self::max_rounds(n) {
            let needed = n - collected.len();
            let mut tasks = JoinSet::new();

            for _ in 0..needed {
                attempt_number += 1;
                let number = attempt_number;
                let semaphore = self.semaphore.clone();
                let attempt = attempt.clone();
                let prompt = prompt.to_string();

                tasks.spawn(async move {
                    // permit 在任务结束 (包括失败) 时释放
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| GatewayError::Config("生图并发信号量已关闭".to_string()))?;
                    attempt.attempt(number, &prompt).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(url)) => {
                        if collected.contains(&url) {
                            tracing::debug!("忽略重复图片: {}", url);
                        } else {
                            collected.push(url);
                        }
                    }
                    Ok(Err(e)) => tracing::warn!("生图尝试失败 (第 {} 轮): {}", round, e),
                    Err(e) => tracing::warn!("生图任务异常退出 (第 {} 轮): {}", round, e),
                }
            }

            tracing::info!("生图第 {} 轮结束: {}/{}", round, collected.len(), n);
            if collected.len() >= n {
                collected.truncate(n);
                return Ok(collected);
            }
        }

        tracing::error!(
            "生图重试耗尽: 共 {} 次尝试，仅得到 {}/{} 张",
            attempt_number,
            collected.len(),
            n
        );
        Err(GatewayError::InsufficientResults {
            requested: n,
            collected: collected.len(),
        })
    }
}

impl Default for RetryOrchestrator {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// 下载并编码为 base64
///
/// 单张失败跳过，全部失败才返回错误
pub async fn encode_images<F, Fut>(urls: &[String], fetch: F) -> Result<Vec<String>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Bytes>>,
{
    let downloads = urls.iter().map(|url| {
        let fut = fetch(url.clone());
        async move { (url, fut.await) }
    });

    let mut encoded = Vec::with_capacity(urls.len());
    for (url, result) in futures::future::join_all(downloads).await {
        match result {
            Ok(bytes) => encoded.push(general_purpose::STANDARD.encode(&bytes)),
            Err(e) => tracing::warn!("下载图片失败，已跳过 {}: {}", url, e),
        }
    }

    if encoded.is_empty() {
        return Err(GatewayError::InsufficientResults {
            requested: urls.len(),
            collected: 0,
        });
    }
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 第 k 次尝试 (k 为 fail_every 的倍数) 失败，其余返回唯一地址
    struct FailEvery {
        fail_every: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageAttempt for FailEvery {
        async fn attempt(&self, attempt_number: usize, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if attempt_number % self.fail_every == 0 {
                Err(GatewayError::Protocol("no image".to_string()))
            } else {
                Ok(format!("https://cdn.example/{}.png", attempt_number))
            }
        }
    }

    struct AlwaysFail {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageAttempt for AlwaysFail {
        async fn attempt(&self, _attempt_number: usize, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Transport("reset".to_string()))
        }
    }

    /// 总是返回同一地址
    struct SameUrl;

    #[async_trait]
    impl ImageAttempt for SameUrl {
        async fn attempt(&self, _attempt_number: usize, _prompt: &str) -> Result<String> {
            Ok("https://cdn.example/same.png".to_string())
        }
    }

    /// 记录同时在途的最大数量
    struct Tracked {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ImageAttempt for Tracked {
        async fn attempt(&self, attempt_number: usize, _prompt: &str) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("https://cdn.example/{}.png", attempt_number))
        }
    }

    #[tokio::test]
    async fn test_fail_every_third_collects_three_distinct() {
        let attempt = Arc::new(FailEvery { fail_every: 3, calls: AtomicUsize::new(0) });
        let orchestrator = RetryOrchestrator::with_defaults();

        let urls = orchestrator.collect(attempt.clone(), "cat", 3).await.unwrap();
        assert_eq!(urls.len(), 3);
        let mut unique = urls.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
        // 第一轮 3 次 (第 3 次失败)，第二轮补 1 次
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 4);
        assert!(attempt.calls.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test]
    async fn test_always_fail_exhausts_rounds() {
        let attempt = Arc::new(AlwaysFail { calls: AtomicUsize::new(0) });
        let orchestrator = RetryOrchestrator::with_defaults();

        let err = orchestrator.collect(attempt.clone(), "cat", 3).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InsufficientResults { requested: 3, collected: 0 }
        ));
        // 2n 轮，每轮 n 次
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 18);
    }

    #[tokio::test]
    async fn test_duplicates_never_pad_results() {
        let orchestrator = RetryOrchestrator::with_defaults();
        let err = orchestrator.collect(Arc::new(SameUrl), "cat", 2).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InsufficientResults { requested: 2, collected: 1 }
        ));
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_semaphore() {
        let attempt = Arc::new(Tracked {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let orchestrator = RetryOrchestrator::new(2);

        let urls = orchestrator.collect(attempt.clone(), "cat", 6).await.unwrap();
        assert_eq!(urls.len(), 6);
        assert!(attempt.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_encode_images_skips_failed_downloads() {
        let urls = vec!["ok-1".to_string(), "broken".to_string(), "ok-2".to_string()];
        let encoded = encode_images(&urls, |url| async move {
            if url == "broken" {
                Err(GatewayError::Transport("timeout".to_string()))
            } else {
                Ok(Bytes::from(url.into_bytes()))
            }
        })
        .await
        .unwrap();

        assert_eq!(
            encoded,
            vec![
                general_purpose::STANDARD.encode("ok-1"),
                general_purpose::STANDARD.encode("ok-2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_encode_images_all_failed_is_error() {
        let urls = vec!["a".to_string(), "b".to_string()];
        let result = encode_images(&urls, |_url| async move {
            Err::<Bytes, _>(GatewayError::Transport("timeout".to_string()))
        })
        .await;
        assert!(matches!(result, Err(GatewayError::InsufficientResults { collected: 0, .. })));
    }
}
