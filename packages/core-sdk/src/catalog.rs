//! 内置模型配置目录与凭据族推断规则。
//!
//! 内置配置早于 `api_provider` 字段存在，因此其凭据族由 base_url 与模型名推断。

use crate::models::{DEFAULT_BASE_URL, DEFAULT_TEMPERATURE};

/** \brief 内置配置统一使用的客户端类型。 */
pub const BUILTIN_PROVIDER: &str = "OpenAIChatCompletionClient";
/** \brief 未知名称回退到的内置配置。 */
pub const DEFAULT_PROFILE: &str = "DeepSeek-Chat";

/**
 * \brief 代码内固定的模型配置。
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuiltinProfile {
    pub name: &'static str,
    pub provider: &'static str,
    pub model_id: &'static str,
    pub base_url: &'static str,
    pub temperature: f64,
}

impl BuiltinProfile {
    pub fn credential_family(&self) -> &'static str {
        infer_credential_family(self.base_url, self.model_id)
    }
}

const fn openrouter(name: &'static str, model_id: &'static str) -> BuiltinProfile {
    BuiltinProfile {
        name,
        provider: BUILTIN_PROVIDER,
        model_id,
        base_url: DEFAULT_BASE_URL,
        temperature: DEFAULT_TEMPERATURE,
    }
}

pub const BUILTIN_PROFILES: [BuiltinProfile; 5] = [
    openrouter("DeepSeek-Chat", "deepseek/deepseek-chat"),
    openrouter("GPT-4o-Mini", "openai/gpt-4o-mini"),
    openrouter("Claude-Sonnet-3.5", "anthropic/claude-3.5-sonnet"),
    openrouter("Gemini-Flash", "google/gemini-2.0-flash-exp"),
    openrouter("Gemini-Pro", "google/gemini-pro-1.5"),
];

pub fn builtin(name: &str) -> Option<&'static BuiltinProfile> {
    BUILTIN_PROFILES.iter().find(|p| p.name == name)
}

pub fn default_profile() -> &'static BuiltinProfile {
    // DEFAULT_PROFILE 必须在目录中，见 tests::test_default_profile_is_in_catalog
    builtin(DEFAULT_PROFILE).unwrap_or(&BUILTIN_PROFILES[0])
}

/**
 * \brief 推断规则：参数为小写后的 (base_url, model_id)。
 */
pub type CredentialRule = fn(&str, &str) -> bool;

/**
 * \brief 按顺序逐条匹配，先命中者生效；厂商专属的域名/模型提示排在通用规则之前。
 */
pub const CREDENTIAL_RULES: [(CredentialRule, &str); 6] = [
    (
        |base, model| base.contains("generativelanguage.googleapis.com") || model.contains("gemini"),
        "GEMINI",
    ),
    (|base, _| base.contains("openrouter"), "OPENROUTER"),
    (|base, _| base.contains("groq"), "GROQ"),
    (
        |base, model| base.contains("x.ai") || model.contains("grok"),
        "GROK",
    ),
    (
        |base, model| {
            base.contains("deepseek") || (model.contains("deepseek") && !base.contains("openrouter"))
        },
        "DEEPSEEK",
    ),
    (
        |base, model| base.contains("openai") || model.contains("gpt") || base.is_empty(),
        "OPENAI",
    ),
];

pub const FALLBACK_CREDENTIAL_FAMILY: &str = "OPENAI";

pub fn infer_credential_family(base_url: &str, model_id: &str) -> &'static str {
    let base = base_url.to_ascii_lowercase();
    let model = model_id.to_ascii_lowercase();
    CREDENTIAL_RULES
        .iter()
        .find(|(rule, _)| rule(&base, &model))
        .map(|(_, family)| *family)
        .unwrap_or(FALLBACK_CREDENTIAL_FAMILY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_is_in_catalog() {
        assert!(builtin(DEFAULT_PROFILE).is_some());
        assert_eq!(default_profile().model_id, "deepseek/deepseek-chat");
    }

    #[test]
    fn test_gemini_model_hint_beats_openrouter_base() {
        assert_eq!(
            infer_credential_family("https://openrouter.ai/api/v1", "google/gemini-pro-1.5"),
            "GEMINI"
        );
        assert_eq!(
            infer_credential_family(
                "https://generativelanguage.googleapis.com/v1beta",
                "some-model"
            ),
            "GEMINI"
        );
    }

    #[test]
    fn test_deepseek_model_via_aggregator_uses_aggregator_key() {
        assert_eq!(
            infer_credential_family("https://openrouter.ai/api/v1", "deepseek/deepseek-chat"),
            "OPENROUTER"
        );
        assert_eq!(
            infer_credential_family("https://example.com/v1", "deepseek-chat"),
            "DEEPSEEK"
        );
        assert_eq!(
            infer_credential_family("https://api.deepseek.com", "chat"),
            "DEEPSEEK"
        );
    }

    #[test]
    fn test_vendor_rules_precede_openai_fallback() {
        assert_eq!(
            infer_credential_family("https://api.groq.com/openai/v1", "llama3-70b"),
            "GROQ"
        );
        assert_eq!(infer_credential_family("https://api.x.ai/v1", "grok-2"), "GROK");
        assert_eq!(infer_credential_family("https://example.com", "grok-beta"), "GROK");
        assert_eq!(infer_credential_family("https://api.openai.com/v1", "o1"), "OPENAI");
        assert_eq!(infer_credential_family("https://example.com", "GPT-4"), "OPENAI");
        assert_eq!(infer_credential_family("", "anything"), "OPENAI");
        assert_eq!(
            infer_credential_family("https://example.com", "mistral-large"),
            FALLBACK_CREDENTIAL_FAMILY
        );
    }

    #[test]
    fn test_builtin_families_are_fixed() {
        let families: Vec<(&str, &str)> = BUILTIN_PROFILES
            .iter()
            .map(|p| (p.name, p.credential_family()))
            .collect();
        assert_eq!(
            families,
            vec![
                ("DeepSeek-Chat", "OPENROUTER"),
                ("GPT-4o-Mini", "OPENROUTER"),
                ("Claude-Sonnet-3.5", "OPENROUTER"),
                ("Gemini-Flash", "GEMINI"),
                ("Gemini-Pro", "GEMINI"),
            ]
        );
    }
}
