//! 内容领域 Agent 共用的配置获取与调用入口。
//!
//! 各 Agent 只关心"用哪个配置名"，配置解析与凭据查找全部经由 [`Session`]。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::llm::{self, ChatOptions};
use crate::models::{Message, ResolvedConfig};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /** \brief 测验题、实操评估、案例分析 */
    Assessment,
    /** \brief 课程宣传册文案 */
    Brochure,
    /** \brief 证明文件核验 */
    Document,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Assessment, AgentKind::Brochure, AgentKind::Document];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Assessment => "assessment",
            AgentKind::Brochure => "brochure",
            AgentKind::Document => "document",
        }
    }

    /**
     * \brief 调用方未指定配置名时使用的配置。
     */
    pub fn default_profile(&self) -> &'static str {
        match self {
            AgentKind::Assessment | AgentKind::Document => "DeepSeek-Chat",
            AgentKind::Brochure => "GPT-4o-Mini",
        }
    }

    /**
     * \brief 领域固定的温度；None 表示沿用配置中的温度。
     */
    pub fn temperature_override(&self) -> Option<f64> {
        match self {
            AgentKind::Brochure => Some(0.7),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown agent kind: {}", s))
    }
}

/**
 * \brief 绑定到某个会话的领域 Agent。
 */
pub struct Agent<'a> {
    kind: AgentKind,
    session: &'a Session,
}

impl<'a> Agent<'a> {
    pub fn new(kind: AgentKind, session: &'a Session) -> Self {
        Self { kind, session }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /**
     * \brief 解析本次调用的配置；choice 为空时用领域默认配置。
     */
    pub fn config(&self, choice: Option<&str>) -> ResolvedConfig {
        let name = choice
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.kind.default_profile());
        self.session.resolve_profile(name)
    }

    /**
     * \brief 以 JSON 输出模式调用模型。
     */
    pub async fn complete_json(
        &self,
        choice: Option<&str>,
        system: &str,
        prompt: &str,
    ) -> Result<String> {
        let config = self.config(choice);
        if !config.has_credential() {
            tracing::warn!(
                agent = %self.kind,
                profile = %config.name,
                family = %config.api_provider,
                "no credential available, provider will likely reject the call"
            );
        }
        let messages = [Message::system(system), Message::user(prompt)];
        let options = ChatOptions {
            temperature: self.kind.temperature_override(),
            json_response: true,
            max_tokens: None,
        };
        llm::chat_once(&config, &messages, &options)
            .await
            .with_context(|| format!("{} agent call via {} failed", self.kind, config.name))
    }
}
