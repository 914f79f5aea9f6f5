use anyhow::{Context, Result};
use std::{collections::BTreeMap, fmt, path::Path, sync::Arc};

/**
 * \brief 系统认识的凭据键，每个凭据族一个。
 */
pub const KNOWN_CREDENTIAL_KEYS: [&str; 6] = [
    "OPENAI_API_KEY",
    "DEEPSEEK_API_KEY",
    "GEMINI_API_KEY",
    "OPENROUTER_API_KEY",
    "GROQ_API_KEY",
    "GROK_API_KEY",
];

/**
 * \brief 凭据族标签到凭据键：`openai` -> `OPENAI_API_KEY`。
 */
pub fn credential_key(family: &str) -> String {
    format!("{}_API_KEY", family.trim().to_ascii_uppercase())
}

/**
 * \brief 从 TOML 文件加载的密钥表，仅取顶层字符串值。
 */
#[derive(Clone, Default)]
pub struct SecretStore {
    entries: BTreeMap<String, String>,
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretStore {
    pub fn from_map(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /**
     * \brief 读取密钥文件；文件不存在时返回空表。
     */
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read secrets file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse secrets file {}", path.display()))
    }

    /**
     * \brief 与 `load` 相同，但解析失败时记录警告并退化为空表。
     */
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!(path = %path.display(), "secrets file ignored: {:#}", err);
                Self::default()
            }
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(raw)?;
        let entries = table
            .into_iter()
            .filter_map(|(key, value)| match value {
                toml::Value::String(s) => Some((key, s)),
                _ => None,
            })
            .collect();
        Ok(Self { entries })
    }

    /**
     * \brief 读取 `.env` 文件（`KEY=value` 行）；文件不存在时返回空表。
     */
    pub fn load_dotenv(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let entries = dotenvy::from_path_iter(path)
            .with_context(|| format!("open env file {}", path.display()))?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()
            .with_context(|| format!("parse env file {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn load_dotenv_or_empty(path: &Path) -> Self {
        match Self::load_dotenv(path) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!(path = %path.display(), "env file ignored: {:#}", err);
                Self::default()
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/**
 * \brief 按 环境变量 -> `.env` 文件 -> 密钥文件 -> 空字符串 的顺序解析凭据。
 * \details `.env` 不写入进程环境，只作为一层只读来源，因此进程环境中的同名值优先；
 *          缺失时返回空字符串而不是错误。
 */
#[derive(Clone)]
pub struct CredentialResolver {
    dotenv: SecretStore,
    secrets: SecretStore,
    env: EnvLookup,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("dotenv", &self.dotenv)
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

impl CredentialResolver {
    /**
     * \brief 构建解析器；环境变量查找由调用方提供（进程环境或测试用映射）。
     */
    pub fn with_env_lookup<F>(secrets: SecretStore, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            dotenv: SecretStore::default(),
            secrets,
            env: Arc::new(lookup),
        }
    }

    pub fn with_dotenv(mut self, dotenv: SecretStore) -> Self {
        self.dotenv = dotenv;
        self
    }

    pub fn resolve(&self, key: &str) -> String {
        if let Some(value) = (self.env)(key).filter(|v| !v.is_empty()) {
            return value;
        }
        [&self.dotenv, &self.secrets]
            .into_iter()
            .filter_map(|store| store.get(key))
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    /**
     * \brief 重新加载后替换文件来源，环境查找保持不变。
     */
    pub fn replace_sources(&mut self, dotenv: SecretStore, secrets: SecretStore) {
        self.dotenv = dotenv;
        self.secrets = secrets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver(env: &[(&str, &str)], secrets: &[(&str, &str)]) -> CredentialResolver {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let secrets = SecretStore::from_map(
            secrets
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        CredentialResolver::with_env_lookup(secrets, move |key| env.get(key).cloned())
    }

    #[test]
    fn test_env_shadows_secret_store() {
        let r = resolver(
            &[("OPENAI_API_KEY", "env-key")],
            &[("OPENAI_API_KEY", "stored-key")],
        );
        assert_eq!(r.resolve("OPENAI_API_KEY"), "env-key");
    }

    #[test]
    fn test_empty_env_falls_through_to_secrets() {
        let r = resolver(&[("GROQ_API_KEY", "")], &[("GROQ_API_KEY", "stored")]);
        assert_eq!(r.resolve("GROQ_API_KEY"), "stored");
    }

    #[test]
    fn test_missing_everywhere_is_empty_string() {
        let r = resolver(&[], &[]);
        assert!(KNOWN_CREDENTIAL_KEYS.iter().all(|key| r.resolve(key).is_empty()));
    }

    #[test]
    fn test_dotenv_sits_between_env_and_secrets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env_file = dir.path().join(".env");
        std::fs::write(
            &env_file,
            "# local overrides\nOPENAI_API_KEY=dotenv-openai\nGROQ_API_KEY=\"dotenv-groq\"\nGEMINI_API_KEY=\n",
        )
        .expect("write");
        let dotenv = SecretStore::load_dotenv(&env_file).expect("load env file");

        let r = resolver(
            &[("GROQ_API_KEY", "env-groq")],
            &[("OPENAI_API_KEY", "stored-openai"), ("GEMINI_API_KEY", "stored-gemini")],
        )
        .with_dotenv(dotenv);
        assert_eq!(r.resolve("GROQ_API_KEY"), "env-groq");
        assert_eq!(r.resolve("OPENAI_API_KEY"), "dotenv-openai");
        assert_eq!(r.resolve("GEMINI_API_KEY"), "stored-gemini");
        assert_eq!(r.resolve("GROK_API_KEY"), "");
    }

    #[test]
    fn test_missing_dotenv_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(SecretStore::load_dotenv(&dir.path().join(".env"))
            .expect("load")
            .is_empty());
    }

    #[test]
    fn test_parse_secrets_keeps_only_top_level_strings() {
        let store = SecretStore::parse(
            r#"
OPENROUTER_API_KEY = "sk-or"
RETRIES = 3

[connections]
OPENAI_API_KEY = "nested"
"#,
        )
        .expect("parse");
        assert_eq!(store.get("OPENROUTER_API_KEY"), Some("sk-or"));
        assert_eq!(store.get("RETRIES"), None);
        assert_eq!(store.get("OPENAI_API_KEY"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_empty_and_malformed_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.toml");
        assert!(SecretStore::load(&missing).expect("load").is_empty());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "this is = = not toml").expect("write");
        assert!(SecretStore::load(&broken).is_err());
        assert!(SecretStore::load_or_empty(&broken).is_empty());
    }

    #[test]
    fn test_credential_key_normalizes_family() {
        assert_eq!(credential_key("openai"), "OPENAI_API_KEY");
        assert_eq!(credential_key(" Gemini "), "GEMINI_API_KEY");
    }

    #[test]
    fn test_debug_output_hides_secret_values() {
        let r = resolver(&[], &[("OPENAI_API_KEY", "sk-very-secret")]);
        let rendered = format!("{:?}", r);
        assert!(rendered.contains("OPENAI_API_KEY"));
        assert!(!rendered.contains("sk-very-secret"));
    }
}
