use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::models::ModelProfile;

#[derive(Debug, Default)]
struct CacheState {
    /** \brief 每次失效递增，防止失效前开始的加载把旧数据写回 */
    generation: u64,
    profiles: Option<Arc<Vec<ModelProfile>>>,
    credentials: BTreeMap<String, String>,
}

/**
 * \brief 会话级缓存：存储层配置列表与已解析的凭据。
 * \details 只做整体失效，不做字段级修补；失效在一次写锁内完成，读方看不到半失效状态。
 */
#[derive(Debug, Default)]
pub struct SessionCache {
    state: RwLock<CacheState>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /**
     * \brief 命中时直接返回缓存列表，否则调用 `load` 并写回。
     * \details `load` 失败时不写入缓存。
     */
    pub fn profiles_or_try_insert<F, E>(&self, load: F) -> Result<Arc<Vec<ModelProfile>>, E>
    where
        F: FnOnce() -> Result<Vec<ModelProfile>, E>,
    {
        let generation = {
            let state = self.read();
            if let Some(hit) = state.profiles.clone() {
                tracing::debug!(count = hit.len(), "profile list cache hit");
                return Ok(hit);
            }
            state.generation
        };
        tracing::debug!("profile list cache miss");
        let loaded = Arc::new(load()?);
        let mut state = self.write();
        if state.generation != generation {
            return Ok(loaded);
        }
        // 并发 miss 时保留先写入者
        Ok(state.profiles.get_or_insert_with(|| loaded).clone())
    }

    pub fn credential_or_insert_with<F>(&self, key: &str, resolve: F) -> String
    where
        F: FnOnce() -> String,
    {
        let generation = {
            let state = self.read();
            if let Some(hit) = state.credentials.get(key) {
                return hit.clone();
            }
            state.generation
        };
        let value = resolve();
        let mut state = self.write();
        if state.generation != generation {
            return value;
        }
        state
            .credentials
            .entry(key.to_string())
            .or_insert(value)
            .clone()
    }

    /**
     * \brief 整体丢弃缓存。
     */
    pub fn invalidate(&self) {
        let mut state = self.write();
        let generation = state.generation.wrapping_add(1);
        *state = CacheState {
            generation,
            ..CacheState::default()
        };
        tracing::debug!("session cache invalidated");
    }
}
