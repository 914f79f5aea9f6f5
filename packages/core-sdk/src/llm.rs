use anyhow::{anyhow, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::{Message, ResolvedConfig};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    OpenAI,
    Claude,
    Gemini,
}

fn provider_kind(config: &ResolvedConfig) -> ProviderKind {
    match config.provider.to_ascii_lowercase().as_str() {
        "claude" | "anthropic" | "anthropicchatcompletionclient" => ProviderKind::Claude,
        "gemini" | "google" | "geminichatcompletionclient" => ProviderKind::Gemini,
        _ => ProviderKind::OpenAI,
    }
}

/**
 * \brief 单次调用的可选参数。
 */
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /** \brief 覆盖配置中的温度 */
    pub temperature: Option<f64>,
    /** \brief 要求模型返回 JSON 对象（仅 OpenAI 兼容协议生效） */
    pub json_response: bool,
    pub max_tokens: Option<u32>,
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

/**
 * \brief 非流式调用，返回完整回复。
 * \details api_key 为空时照常发送，由服务端返回鉴权错误。
 */
pub async fn chat_once(
    config: &ResolvedConfig,
    messages: &[Message],
    options: &ChatOptions,
) -> Result<String> {
    match provider_kind(config) {
        ProviderKind::OpenAI => chat_once_openai(config, messages, options).await,
        ProviderKind::Claude => chat_once_claude(config, messages, options).await,
        ProviderKind::Gemini => chat_once_gemini(config, messages, options).await,
    }
}

/**
 * \brief 列出当前配置可用模型列表，用作连通性检查。
 */
pub async fn list_models(config: &ResolvedConfig) -> Result<Vec<String>> {
    match provider_kind(config) {
        ProviderKind::OpenAI => list_models_openai(config).await,
        ProviderKind::Claude => list_models_claude(config).await,
        ProviderKind::Gemini => list_models_gemini(config).await,
    }
}

fn openai_body(config: &ResolvedConfig, messages: &[Message], options: &ChatOptions) -> Value {
    let mut body = json!({
        "model": config.model_id,
        "messages": messages,
        "temperature": options.temperature.unwrap_or(config.temperature),
        "stream": false
    });
    if options.json_response {
        body["response_format"] = json!({"type": "json_object"});
    }
    if let Some(max) = options.max_tokens {
        body["max_tokens"] = json!(max);
    }
    body
}

async fn chat_once_openai(
    config: &ResolvedConfig,
    messages: &[Message],
    options: &ChatOptions,
) -> Result<String> {
    let resp = http_client()?
        .post(endpoint(&config.base_url, "chat/completions"))
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", config.api_key))
        .json(&openai_body(config, messages, options))
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    Ok(extract_openai_content(&v))
}

async fn list_models_openai(config: &ResolvedConfig) -> Result<Vec<String>> {
    let resp = http_client()?
        .get(endpoint(&config.base_url, "models"))
        .header(AUTHORIZATION, format!("Bearer {}", config.api_key))
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("list models failed: {} -> {}", status, text));
    }
    parse_model_list(resp.json().await?)
}

fn anthropic_headers(config: &ResolvedConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-api-key", HeaderValue::from_str(&config.api_key)?);
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );
    Ok(headers)
}

async fn chat_once_claude(
    config: &ResolvedConfig,
    messages: &[Message],
    options: &ChatOptions,
) -> Result<String> {
    let (system_prompt, payload_messages) = anthropic_payload(messages);

    let mut body = json!({
        "model": config.model_id,
        "max_tokens": options.max_tokens.unwrap_or(1024),
        "temperature": options.temperature.unwrap_or(config.temperature),
        "messages": payload_messages,
    });
    if let Some(sys) = system_prompt {
        body["system"] = json!(sys);
    }

    let resp = http_client()?
        .post(endpoint(&config.base_url, "messages"))
        .headers(anthropic_headers(config)?)
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("claude request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    Ok(extract_anthropic_content(&v))
}

async fn list_models_claude(config: &ResolvedConfig) -> Result<Vec<String>> {
    let resp = http_client()?
        .get(endpoint(&config.base_url, "models"))
        .headers(anthropic_headers(config)?)
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("claude list models failed: {} -> {}", status, text));
    }
    parse_model_list(resp.json().await?)
}

async fn chat_once_gemini(
    config: &ResolvedConfig,
    messages: &[Message],
    options: &ChatOptions,
) -> Result<String> {
    let base = normalize_gemini_base(&config.base_url);
    let url = format!("{}/models/{}:generateContent", base, config.model_id);
    let (system_prompt, contents) = gemini_payload(messages);

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": options.temperature.unwrap_or(config.temperature)
        }
    });
    if options.json_response {
        body["generationConfig"]["responseMimeType"] = json!("application/json");
    }
    if let Some(sys) = system_prompt {
        body["system_instruction"] = json!({
            "parts": [{"text": sys}]
        });
    }

    let resp = http_client()?
        .post(url)
        .query(&[("key", config.api_key.as_str())])
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("gemini request failed: {} -> {}", status, text));
    }
    let v: Value = resp.json().await?;
    Ok(extract_gemini_content(&v))
}

async fn list_models_gemini(config: &ResolvedConfig) -> Result<Vec<String>> {
    let base = normalize_gemini_base(&config.base_url);
    let resp = http_client()?
        .get(format!("{}/models", base))
        .query(&[("key", config.api_key.as_str())])
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("gemini list models failed: {} -> {}", status, text));
    }
    parse_gemini_model_list(resp.json().await?)
}

fn extract_openai_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_anthropic_content(v: &Value) -> String {
    v.get("content")
        .and_then(|arr| arr.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn extract_gemini_content(v: &Value) -> String {
    v.get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|first| first.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn split_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();
    for msg in messages {
        if msg.role == "system" {
            system_parts.push(msg.content.as_str());
        } else {
            rest.push(msg);
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, rest)
}

fn anthropic_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let (system_prompt, rest) = split_system(messages);
    let items = rest
        .into_iter()
        .map(|msg| {
            let role = if msg.role == "assistant" { "assistant" } else { "user" };
            json!({
                "role": role,
                "content": [{"type": "text", "text": msg.content}]
            })
        })
        .collect();
    (system_prompt, items)
}

fn gemini_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let (system_prompt, rest) = split_system(messages);
    let contents = rest
        .into_iter()
        .map(|msg| {
            let role = if msg.role == "assistant" { "model" } else { "user" };
            json!({
                "role": role,
                "parts": [{"text": msg.content}]
            })
        })
        .collect();
    (system_prompt, contents)
}

fn parse_model_list(v: Value) -> Result<Vec<String>> {
    if let Some(arr) = v.get("data").and_then(|x| x.as_array()) {
        Ok(arr
            .iter()
            .filter_map(|item| item.get("id").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect())
    } else {
        Err(anyhow!("unexpected models payload: {}", v))
    }
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

fn parse_gemini_model_list(v: Value) -> Result<Vec<String>> {
    if let Some(arr) = v.get("models").and_then(|x| x.as_array()) {
        Ok(arr
            .iter()
            .filter_map(|item| item.get("name").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect())
    } else {
        Err(anyhow!("unexpected gemini models payload: {}", v))
    }
}
