use std::path::PathBuf;

pub const DEFAULT_DB_PATH: &str = "settings/config/api_config.db";
pub const DEFAULT_LEGACY_PROFILES_PATH: &str = "settings/config/custom_models.json";
pub const DEFAULT_SECRETS_PATH: &str = "settings/config/secrets.toml";
pub const DEFAULT_DOTENV_PATH: &str = ".env";
pub const DEFAULT_LOG_DIR: &str = "logs";

/**
 * \brief 运行期路径配置。
 * \details 环境变量优先，未设置时使用相对当前目录的默认路径；CLI 参数可再次覆盖。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /** \brief 模型配置库 SQLite 文件 */
    pub db_path: PathBuf,
    /** \brief 待一次性导入的旧版 JSON 文件 */
    pub legacy_profiles_path: PathBuf,
    /** \brief TOML 格式的密钥文件 */
    pub secrets_path: PathBuf,
    /** \brief 可选的 `.env` 文件，优先级高于密钥文件 */
    pub dotenv_path: PathBuf,
    /** \brief 文件日志目录 */
    pub log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            legacy_profiles_path: PathBuf::from(DEFAULT_LEGACY_PROFILES_PATH),
            secrets_path: PathBuf::from(DEFAULT_SECRETS_PATH),
            dotenv_path: PathBuf::from(DEFAULT_DOTENV_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

impl Settings {
    /**
     * \brief 从进程环境读取：COURSEWARE_DB / COURSEWARE_LEGACY_MODELS / COURSEWARE_SECRETS / COURSEWARE_DOTENV / COURSEWARE_LOG_DIR。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |key: &str, fallback: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(fallback))
        };
        Self {
            db_path: pick("COURSEWARE_DB", DEFAULT_DB_PATH),
            legacy_profiles_path: pick("COURSEWARE_LEGACY_MODELS", DEFAULT_LEGACY_PROFILES_PATH),
            secrets_path: pick("COURSEWARE_SECRETS", DEFAULT_SECRETS_PATH),
            dotenv_path: pick("COURSEWARE_DOTENV", DEFAULT_DOTENV_PATH),
            log_dir: pick("COURSEWARE_LOG_DIR", DEFAULT_LOG_DIR),
        }
    }

    /**
     * \brief 把所有路径放到同一目录下，测试与临时实例使用。
     */
    pub fn in_dir(dir: &std::path::Path) -> Self {
        Self {
            db_path: dir.join("api_config.db"),
            legacy_profiles_path: dir.join("custom_models.json"),
            secrets_path: dir.join("secrets.toml"),
            dotenv_path: dir.join(".env"),
            log_dir: dir.join("logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_and_blank_falls_back() {
        let settings = Settings::from_lookup(|key| match key {
            "COURSEWARE_DB" => Some("/tmp/x.db".to_string()),
            "COURSEWARE_SECRETS" => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(settings.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(settings.secrets_path, PathBuf::from(DEFAULT_SECRETS_PATH));
        assert_eq!(settings.dotenv_path, PathBuf::from(DEFAULT_DOTENV_PATH));
        assert_eq!(
            settings.legacy_profiles_path,
            PathBuf::from(DEFAULT_LEGACY_PROFILES_PATH)
        );
    }
}
