use serde::{Deserialize, Serialize};

use crate::catalog::BUILTIN_PROVIDER;

/** \brief 未指定时的客户端类型标签。 */
pub const DEFAULT_PROVIDER: &str = "generic-chat-client";
/** \brief 未指定时的聚合网关地址。 */
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
/** \brief 默认采样温度。 */
pub const DEFAULT_TEMPERATURE: f64 = 0.2;
/** \brief 默认凭据族。 */
pub const DEFAULT_API_PROVIDER: &str = "OPENROUTER";

/**
 * \brief 持久化的模型配置（按名称唯一）。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /** \brief 唯一名称，创建后不再重命名 */
    pub name: String,
    /** \brief 客户端/协议族标签 */
    pub provider: String,
    /** \brief 服务商侧的模型标识 */
    pub model_id: String,
    /** \brief API 基地址 */
    pub base_url: String,
    /** \brief 采样温度 */
    pub temperature: f64,
    /** \brief 凭据族标签，如 OPENROUTER / OPENAI / GEMINI */
    pub api_provider: String,
    /** \brief 创建时间（RFC 3339，由存储层写入） */
    pub created_at: String,
    /** \brief 最近更新时间（RFC 3339，由存储层写入） */
    pub updated_at: String,
}

/**
 * \brief 新建模型配置的输入；可选字段为空时在存储层统一补默认值。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProfile {
    pub name: String,
    pub model_id: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub api_provider: Option<String>,
}

impl NewProfile {
    pub fn new(name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn api_provider(mut self, api_provider: impl Into<String>) -> Self {
        self.api_provider = Some(api_provider.into());
        self
    }

    /**
     * \brief 补齐默认值后的字段，顺序为 (provider, base_url, temperature, api_provider)。
     * \details 空字符串与未提供等价。
     */
    pub fn resolved_fields(&self) -> (String, String, f64, String) {
        (
            non_empty_or(self.provider.as_deref(), DEFAULT_PROVIDER),
            non_empty_or(self.base_url.as_deref(), DEFAULT_BASE_URL),
            self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            non_empty_or(self.api_provider.as_deref(), DEFAULT_API_PROVIDER),
        )
    }
}

fn non_empty_or(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => fallback.to_string(),
    }
}

/**
 * \brief 局部更新；为 None 的字段保持原值。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub api_provider: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.model_id.is_none()
            && self.provider.is_none()
            && self.base_url.is_none()
            && self.temperature.is_none()
            && self.api_provider.is_none()
    }
}

/**
 * \brief 调用时组装的完整配置，包含即时解析出的 API Key；从不落盘。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    /** \brief 实际命中的配置名（未知名称时为默认内置配置名） */
    pub name: String,
    pub provider: String,
    pub model_id: String,
    pub base_url: String,
    /** \brief 空字符串表示没有可用凭据 */
    pub api_key: String,
    pub temperature: f64,
    /** \brief 用于查找凭据的凭据族 */
    pub api_provider: String,
}

impl ResolvedConfig {
    pub fn has_credential(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/**
 * \brief 旧版 JSON 文件中的一条记录：`{name, provider?, config: {model, base_url?, temperature?}, api_provider?}`。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub config: LegacyModelConfig,
    #[serde(default)]
    pub api_provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyModelConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl LegacyProfile {
    /**
     * \brief 转为新建输入；名称或模型为空时返回 None。
     * \details 旧版记录未写 provider 时沿用内置配置的客户端类型。
     */
    pub fn to_new_profile(&self) -> Option<NewProfile> {
        let name = self.name.trim();
        let model = self.config.model.trim();
        if name.is_empty() || model.is_empty() {
            return None;
        }
        Some(NewProfile {
            name: name.to_string(),
            model_id: model.to_string(),
            provider: Some(
                self.provider
                    .clone()
                    .unwrap_or_else(|| BUILTIN_PROVIDER.to_string()),
            ),
            base_url: self.config.base_url.clone(),
            temperature: self.config.temperature,
            api_provider: self.api_provider.clone(),
        })
    }
}

/**
 * \brief 凭据族级别的附加设置。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSetting {
    pub provider_name: String,
    pub is_enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}
