use std::collections::HashMap;

use serde::Serialize;

/// 模型映射器
/// 负责把客户端传入的模型名归一化为上游支持的模型名
pub struct ModelMapper {
    /// 用户自定义映射 (优先级最高)
    custom_mapping: HashMap<String, String>,
}

/// 上游支持的模型列表 (直接透传)
pub const SUPPORTED_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "claude",
    "claude-3-haiku",
    "claude-3-5-sonnet",
    "claude-3-7-sonnet",
    "sonar-reasoning-pro",
    "deepseek-r1",
];

/// 未知模型回退值
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// `/v1/models` 中的单个条目
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

/// `/v1/models` 响应体
#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

impl ModelMapper {
    /// 创建新的模型映射器
    pub fn new(custom_mapping: HashMap<String, String>) -> Self {
        Self { custom_mapping }
    }

    /// 创建空的模型映射器 (无自定义映射)
    pub fn empty() -> Self {
        Self {
            custom_mapping: HashMap::new(),
        }
    }

    /// 映射模型名称
    /// 优先级: 用户自定义映射 > 固定别名 > 支持列表 > 默认模型
    pub fn map_model_name(&self, model_name: &str) -> String {
        // 1. 用户自定义映射优先
        if let Some(mapped) = self.custom_mapping.get(model_name) {
            return mapped.clone();
        }

        let lower_name = model_name.trim().to_lowercase();

        // 2. 固定别名，需在默认回退之前处理
        let aliased = match lower_name.as_str() {
            "claude-3.5-sonnet" => "claude-3-5-sonnet",
            "gpt 4o" => "gpt-4o",
            other => other,
        };

        // 3. 已支持的模型直接返回
        if SUPPORTED_MODELS.contains(&aliased) {
            return aliased.to_string();
        }

        tracing::debug!("未知模型 {}，回退到 {}", model_name, DEFAULT_MODEL);
        DEFAULT_MODEL.to_string()
    }

    /// 静态模型目录
    pub fn catalog() -> ModelList {
        let created = chrono::Utc::now().timestamp();
        ModelList {
            object: "list",
            data: SUPPORTED_MODELS
                .iter()
                .map(|id| ModelEntry {
                    id: id.to_string(),
                    object: "model",
                    created,
                    owned_by: Self::owner_of(id),
                })
                .collect(),
        }
    }

    fn owner_of(model: &str) -> &'static str {
        if model.starts_with("gpt") {
            "openai"
        } else if model.starts_with("claude") {
            "anthropic"
        } else if model.starts_with("sonar") {
            "perplexity"
        } else if model.starts_with("deepseek") {
            "deepseek"
        } else {
            "chaton"
        }
    }
}

impl Default for ModelMapper {
    fn default() -> Self {
        Self::empty()
    }
}
