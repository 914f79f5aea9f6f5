use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use rusqlite::Connection;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use crate::cache::SessionCache;
use crate::catalog;
use crate::config::Settings;
use crate::credentials::{credential_key, CredentialResolver, SecretStore, KNOWN_CREDENTIAL_KEYS};
use crate::db;
use crate::legacy;
use crate::models::{
    ModelProfile, NewProfile, ProfileUpdate, ProviderSetting, ResolvedConfig,
    DEFAULT_API_PROVIDER, DEFAULT_BASE_URL,
};

/**
 * \brief 一个交互会话的配置入口：按名称解析配置，并代理配置的增删改查。
 * \details 每个会话独占自己的缓存；多个会话只共享底层 SQLite 文件。
 *          所有写操作结束后整体失效缓存，下一次解析重新读取存储层。
 */
pub struct Session {
    conn: Mutex<Connection>,
    credentials: RwLock<CredentialResolver>,
    cleared_credentials: RwLock<BTreeSet<String>>,
    cache: SessionCache,
    legacy_path: Option<PathBuf>,
    secrets_path: Option<PathBuf>,
    dotenv_path: Option<PathBuf>,
    legacy_checked: OnceCell<usize>,
}

impl Session {
    /**
     * \brief 按运行配置打开会话：打开数据库、建表、加载 `.env` 与密钥文件。
     */
    pub fn open(settings: &Settings) -> Result<Self> {
        Self::open_with_env_lookup(settings, |key| std::env::var(key).ok())
    }

    /**
     * \brief 同 `open`，但使用给定的环境变量查找函数。
     */
    pub fn open_with_env_lookup<F>(settings: &Settings, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let conn = db::open_db(&settings.db_path)
            .with_context(|| format!("open profile store {}", settings.db_path.display()))?;
        let resolver = CredentialResolver::with_env_lookup(
            SecretStore::load_or_empty(&settings.secrets_path),
            lookup,
        )
        .with_dotenv(SecretStore::load_dotenv_or_empty(&settings.dotenv_path));
        let mut session = Self::from_connection(conn, resolver)?;
        session.legacy_path = Some(settings.legacy_profiles_path.clone());
        session.secrets_path = Some(settings.secrets_path.clone());
        session.dotenv_path = Some(settings.dotenv_path.clone());
        Ok(session)
    }

    pub fn from_connection(conn: Connection, credentials: CredentialResolver) -> Result<Self> {
        db::migrate(&conn).context("apply migrations failed")?;
        Ok(Self {
            conn: Mutex::new(conn),
            credentials: RwLock::new(credentials),
            cleared_credentials: RwLock::new(BTreeSet::new()),
            cache: SessionCache::new(),
            legacy_path: None,
            secrets_path: None,
            dotenv_path: None,
            legacy_checked: OnceCell::new(),
        })
    }

    pub fn with_legacy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_path = Some(path.into());
        self
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /**
     * \brief 所有存储访问的入口；首次访问时触发旧版文件导入。
     */
    fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock_conn();
        self.ensure_legacy_imported(&conn);
        op(&conn)
    }

    fn ensure_legacy_imported(&self, conn: &Connection) -> usize {
        *self.legacy_checked.get_or_init(|| {
            let Some(path) = &self.legacy_path else {
                return 0;
            };
            match legacy::import_legacy_file(conn, path) {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(path = %path.display(), "legacy profile import failed: {:#}", err);
                    0
                }
            }
        })
    }

    /**
     * \brief 显式触发旧版导入（若本会话尚未检查过）。
     */
    pub fn import_legacy(&self) -> usize {
        let conn = self.lock_conn();
        self.ensure_legacy_imported(&conn)
    }

    fn mutate<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let result = self.with_store(op);
        self.cache.invalidate();
        result
    }

    /**
     * \brief 注册新配置；同名已存在时返回 false。
     */
    pub fn create_profile(&self, profile: &NewProfile) -> Result<bool> {
        self.mutate(|conn| db::create_profile(conn, profile))
    }

    pub fn update_profile(&self, name: &str, update: &ProfileUpdate) -> Result<bool> {
        self.mutate(|conn| db::update_profile(conn, name, update))
    }

    pub fn delete_profile(&self, name: &str) -> Result<bool> {
        self.mutate(|conn| db::delete_profile(conn, name))
    }

    pub fn get_profile(&self, name: &str) -> Result<Option<ModelProfile>> {
        self.with_store(|conn| db::get_profile(conn, name))
    }

    pub fn profile_exists(&self, name: &str) -> Result<bool> {
        self.with_store(|conn| db::profile_exists(conn, name))
    }

    /**
     * \brief 存储层中的全部配置（经会话缓存）。
     */
    pub fn list_profiles(&self) -> Result<Arc<Vec<ModelProfile>>> {
        self.cache
            .profiles_or_try_insert(|| self.with_store(db::list_profiles))
    }

    /**
     * \brief 内置配置与存储层配置的名称并集，升序。
     */
    pub fn available_profiles(&self) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = catalog::BUILTIN_PROFILES
            .iter()
            .map(|p| p.name.to_string())
            .collect();
        names.extend(self.list_profiles()?.iter().map(|p| p.name.clone()));
        Ok(names.into_iter().collect())
    }

    /**
     * \brief 解析配置名为可直接调用的完整配置；永不失败。
     * \details 存储层同名配置优先于内置配置；未知名称回退到默认内置配置；
     *          存储层读取失败时只使用内置目录。
     */
    pub fn resolve_profile(&self, name: &str) -> ResolvedConfig {
        let profiles = match self.list_profiles() {
            Ok(profiles) => profiles,
            Err(err) => {
                tracing::warn!("profile store unavailable, using built-in catalog: {:#}", err);
                Arc::new(Vec::new())
            }
        };

        if let Some(profile) = profiles.iter().find(|p| p.name == name) {
            let api_provider = non_empty_or(&profile.api_provider, DEFAULT_API_PROVIDER);
            return ResolvedConfig {
                name: profile.name.clone(),
                provider: profile.provider.clone(),
                model_id: profile.model_id.clone(),
                base_url: non_empty_or(&profile.base_url, DEFAULT_BASE_URL),
                api_key: self.credential(&credential_key(&api_provider)),
                temperature: profile.temperature,
                api_provider,
            };
        }

        let builtin = catalog::builtin(name).unwrap_or_else(|| {
            tracing::debug!(requested = name, fallback = catalog::DEFAULT_PROFILE, "unknown profile");
            catalog::default_profile()
        });
        let family = builtin.credential_family();
        ResolvedConfig {
            name: builtin.name.to_string(),
            provider: builtin.provider.to_string(),
            model_id: builtin.model_id.to_string(),
            base_url: builtin.base_url.to_string(),
            api_key: self.credential(&credential_key(family)),
            temperature: builtin.temperature,
            api_provider: family.to_string(),
        }
    }

    /**
     * \brief 取单个凭据；本会话清除过的键返回空字符串。
     */
    pub fn credential(&self, key: &str) -> String {
        let cleared = self
            .cleared_credentials
            .read()
            .map(|set| set.contains(key))
            .unwrap_or(false);
        if cleared {
            return String::new();
        }
        self.cache.credential_or_insert_with(key, || {
            self.credentials
                .read()
                .map(|resolver| resolver.resolve(key))
                .unwrap_or_default()
        })
    }

    /**
     * \brief 全部已知凭据键的当前值。
     */
    pub fn credential_set(&self) -> BTreeMap<String, String> {
        KNOWN_CREDENTIAL_KEYS
            .iter()
            .map(|key| (key.to_string(), self.credential(key)))
            .collect()
    }

    /**
     * \brief 仅在本会话内清空一个已知凭据，不修改任何持久化来源。
     * \return 未知的键返回 false。
     */
    pub fn clear_credential(&self, key: &str) -> bool {
        if !KNOWN_CREDENTIAL_KEYS.contains(&key) {
            return false;
        }
        if let Ok(mut set) = self.cleared_credentials.write() {
            set.insert(key.to_string());
        }
        self.cache.invalidate();
        true
    }

    /**
     * \brief 重新读取 `.env` 与密钥文件，撤销本会话的清除操作并失效缓存。
     */
    pub fn reload_credentials(&self) {
        if let Some(path) = &self.secrets_path {
            let secrets = SecretStore::load_or_empty(path);
            let dotenv = self
                .dotenv_path
                .as_deref()
                .map(SecretStore::load_dotenv_or_empty)
                .unwrap_or_default();
            if let Ok(mut resolver) = self.credentials.write() {
                resolver.replace_sources(dotenv, secrets);
            }
        }
        if let Ok(mut set) = self.cleared_credentials.write() {
            set.clear();
        }
        self.cache.invalidate();
    }

    /**
     * \brief 读取遥测开关（供 CLI / HTTP 层初始化日志）。
     */
    pub fn telemetry_enabled(&self) -> Result<bool> {
        self.with_store(db::get_telemetry_enabled)
    }

    pub fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.with_store(|conn| db::set_telemetry_enabled(conn, enabled))
    }

    pub fn provider_settings(&self) -> Result<Vec<ProviderSetting>> {
        self.with_store(db::list_provider_settings)
    }

    pub fn provider_setting(&self, name: &str) -> Result<Option<ProviderSetting>> {
        self.with_store(|conn| db::get_provider_setting(conn, name))
    }

    pub fn set_provider_setting(&self, setting: &ProviderSetting) -> Result<()> {
        self.with_store(|conn| db::set_provider_setting(conn, setting))
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
