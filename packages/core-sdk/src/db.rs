use anyhow::{Context, Result};
use rusqlite::{
    params, params_from_iter, types::Value, Connection, ErrorCode, OptionalExtension, Row,
    Transaction, TransactionBehavior,
};
use std::{path::Path, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::{ModelProfile, NewProfile, ProfileUpdate, ProviderSetting};

const PROFILE_COLUMNS: &str =
    "name, provider, model_id, base_url, temperature, api_provider, created_at, updated_at";

/**
 * \brief 打开指定路径的数据库文件，必要时创建父目录。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db directory {}", parent.display()))?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS model_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            provider TEXT NOT NULL DEFAULT 'generic-chat-client',
            model_id TEXT NOT NULL,
            base_url TEXT NOT NULL DEFAULT 'https://openrouter.ai/api/v1',
            temperature REAL NOT NULL DEFAULT 0.2,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS provider_settings (
            provider_name TEXT PRIMARY KEY,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            base_url TEXT,
            updated_at TEXT NOT NULL
        );
        "#,
        )
    })?;

    ensure_column(
        conn,
        "model_profiles",
        "api_provider",
        "ALTER TABLE model_profiles ADD COLUMN api_provider TEXT NOT NULL DEFAULT 'OPENROUTER'",
    )?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        match retry_on_locked(|| conn.execute(ddl, [])) {
            Ok(_) => {}
            // 并发迁移时另一连接可能已补上该列
            Err(err) if err.to_string().contains("duplicate column") => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/**
 * \brief 以 IMMEDIATE 模式开启写事务；未 commit 即 drop 时自动回滚。
 */
pub(crate) fn begin_write(conn: &Connection) -> Result<Transaction<'_>> {
    retry_on_locked(|| Transaction::new_unchecked(conn, TransactionBehavior::Immediate))
}

pub(crate) fn now_timestamp() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

fn map_profile(row: &Row<'_>) -> rusqlite::Result<ModelProfile> {
    Ok(ModelProfile {
        name: row.get(0)?,
        provider: row.get(1)?,
        model_id: row.get(2)?,
        base_url: row.get(3)?,
        temperature: row.get(4)?,
        api_provider: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/**
 * \brief 新增模型配置。
 * \return 名称已存在（或名称、模型为空）时返回 false，不覆盖已有记录。
 */
pub fn create_profile(conn: &Connection, profile: &NewProfile) -> Result<bool> {
    let tx = begin_write(conn)?;
    let inserted = insert_profile_row(&tx, profile)?;
    tx.commit()?;
    Ok(inserted)
}

/**
 * \brief 不带事务的插入，由调用方负责事务边界。
 */
pub(crate) fn insert_profile_row(conn: &Connection, profile: &NewProfile) -> Result<bool> {
    let name = profile.name.trim();
    let model_id = profile.model_id.trim();
    if name.is_empty() || model_id.is_empty() {
        return Ok(false);
    }
    let (provider, base_url, temperature, api_provider) = profile.resolved_fields();
    let now = now_timestamp()?;
    let rows = conn.execute(
        "INSERT INTO model_profiles (name, provider, model_id, base_url, temperature, api_provider, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(name) DO NOTHING",
        params![name, provider, model_id, base_url, temperature, api_provider, now],
    )?;
    Ok(rows == 1)
}

/**
 * \brief 按名称精确查找。
 */
pub fn get_profile(conn: &Connection, name: &str) -> Result<Option<ModelProfile>> {
    conn.query_row(
        &format!("SELECT {} FROM model_profiles WHERE name=?1", PROFILE_COLUMNS),
        params![name],
        map_profile,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出所有模型配置，按名称升序。
 */
pub fn list_profiles(conn: &Connection) -> Result<Vec<ModelProfile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM model_profiles ORDER BY name ASC",
        PROFILE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_profile)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn profile_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM model_profiles WHERE name=?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn count_profiles(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM model_profiles", [], |row| row.get(0))?)
}

/**
 * \brief 局部更新模型配置，只写入提供的字段并刷新 updated_at。
 * \details 空字符串视为未提供；没有任何字段时直接返回 true。
 * \return 没有匹配的记录时返回 false。
 */
pub fn update_profile(conn: &Connection, name: &str, update: &ProfileUpdate) -> Result<bool> {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    let text_fields = [
        ("model_id=?", &update.model_id),
        ("provider=?", &update.provider),
        ("base_url=?", &update.base_url),
        ("api_provider=?", &update.api_provider),
    ];
    for (clause, field) in text_fields {
        if let Some(v) = field.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            sets.push(clause);
            values.push(Value::Text(v.to_string()));
        }
    }
    if let Some(t) = update.temperature {
        sets.push("temperature=?");
        values.push(Value::Real(t));
    }

    if sets.is_empty() {
        return Ok(true);
    }

    sets.push("updated_at=?");
    values.push(Value::Text(now_timestamp()?));
    values.push(Value::Text(name.to_string()));

    let sql = format!("UPDATE model_profiles SET {} WHERE name=?", sets.join(", "));
    let tx = begin_write(conn)?;
    let rows = tx.execute(&sql, params_from_iter(values.iter()))?;
    tx.commit()?;
    Ok(rows > 0)
}

/**
 * \brief 删除模型配置。
 * \return 没有匹配的记录时返回 false。
 */
pub fn delete_profile(conn: &Connection, name: &str) -> Result<bool> {
    let tx = begin_write(conn)?;
    let rows = tx.execute("DELETE FROM model_profiles WHERE name=?1", params![name])?;
    tx.commit()?;
    Ok(rows > 0)
}

pub(crate) fn get_config_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn set_config_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_config_value(conn, key)?
        .map(|s| s == "1")
        .unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_config_value(conn, "telemetry_enabled", if enabled { "1" } else { "0" })
}

/**
 * \brief 读取凭据族设置。
 */
pub fn get_provider_setting(conn: &Connection, provider_name: &str) -> Result<Option<ProviderSetting>> {
    conn.query_row(
        "SELECT provider_name, is_enabled, base_url FROM provider_settings WHERE provider_name=?1",
        params![provider_name],
        |row| {
            Ok(ProviderSetting {
                provider_name: row.get(0)?,
                is_enabled: row.get::<_, i64>(1)? != 0,
                base_url: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 写入或覆盖凭据族设置。
 */
pub fn set_provider_setting(conn: &Connection, setting: &ProviderSetting) -> Result<()> {
    let now = now_timestamp()?;
    let tx = begin_write(conn)?;
    tx.execute(
        "INSERT INTO provider_settings (provider_name, is_enabled, base_url, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(provider_name) DO UPDATE SET
            is_enabled=excluded.is_enabled,
            base_url=excluded.base_url,
            updated_at=excluded.updated_at",
        params![
            setting.provider_name,
            setting.is_enabled as i64,
            setting.base_url,
            now
        ],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn list_provider_settings(conn: &Connection) -> Result<Vec<ProviderSetting>> {
    let mut stmt = conn.prepare(
        "SELECT provider_name, is_enabled, base_url FROM provider_settings ORDER BY provider_name ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ProviderSetting {
                provider_name: row.get(0)?,
                is_enabled: row.get::<_, i64>(1)? != 0,
                base_url: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
pub(crate) fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_create_applies_defaults_and_rejects_duplicates() {
        let conn = mem_conn();
        let created = create_profile(&conn, &NewProfile::new("TeamGPT", "openai/gpt-4o"))
            .expect("create");
        assert!(created);

        let before = get_profile(&conn, "TeamGPT").expect("get").expect("exists");
        assert_eq!(before.provider, "generic-chat-client");
        assert_eq!(before.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(before.temperature, 0.2);
        assert_eq!(before.api_provider, "OPENROUTER");
        assert_eq!(before.created_at, before.updated_at);

        let again = create_profile(
            &conn,
            &NewProfile::new("TeamGPT", "other/model").temperature(0.9),
        )
        .expect("create duplicate");
        assert!(!again);
        assert_eq!(count_profiles(&conn).expect("count"), 1);
        let after = get_profile(&conn, "TeamGPT").expect("get").expect("exists");
        assert_eq!(before, after);
    }

    #[test]
    fn test_create_rejects_blank_name_or_model() {
        let conn = mem_conn();
        assert!(!create_profile(&conn, &NewProfile::new("", "m")).expect("create"));
        assert!(!create_profile(&conn, &NewProfile::new("x", "  ")).expect("create"));
        assert_eq!(count_profiles(&conn).expect("count"), 0);
    }

    #[test]
    fn test_list_is_sorted_by_name() {
        let conn = mem_conn();
        for name in ["zeta", "Alpha", "beta"] {
            assert!(create_profile(&conn, &NewProfile::new(name, "m")).expect("create"));
        }
        let names: Vec<String> = list_profiles(&conn)
            .expect("list")
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "beta", "zeta"]);
    }

    #[test]
    fn test_update_touches_only_supplied_fields() {
        let conn = mem_conn();
        create_profile(
            &conn,
            &NewProfile::new("p1", "deepseek/deepseek-chat").api_provider("DEEPSEEK"),
        )
        .expect("create");
        let before = get_profile(&conn, "p1").expect("get").expect("exists");
        thread::sleep(Duration::from_millis(5));

        let update = ProfileUpdate {
            temperature: Some(0.7),
            ..ProfileUpdate::default()
        };
        assert!(update_profile(&conn, "p1", &update).expect("update"));

        let after = get_profile(&conn, "p1").expect("get").expect("exists");
        assert_eq!(after.temperature, 0.7);
        assert_eq!(after.model_id, before.model_id);
        assert_eq!(after.provider, before.provider);
        assert_eq!(after.base_url, before.base_url);
        assert_eq!(after.api_provider, before.api_provider);
        assert_eq!(after.created_at, before.created_at);
        let parse = |ts: &str| OffsetDateTime::parse(ts, &Rfc3339).expect("rfc3339");
        assert_ne!(after.updated_at, before.updated_at);
        assert!(parse(&after.updated_at) > parse(&before.updated_at));
    }

    #[test]
    fn test_update_empty_is_noop_and_missing_is_false() {
        let conn = mem_conn();
        create_profile(&conn, &NewProfile::new("p1", "m")).expect("create");
        let before = get_profile(&conn, "p1").expect("get").expect("exists");
        assert!(update_profile(&conn, "p1", &ProfileUpdate::default()).expect("noop"));
        assert_eq!(get_profile(&conn, "p1").expect("get").expect("exists"), before);

        let update = ProfileUpdate {
            model_id: Some("n".into()),
            ..ProfileUpdate::default()
        };
        assert!(!update_profile(&conn, "missing", &update).expect("update missing"));
    }

    #[test]
    fn test_delete_reports_affected_rows() {
        let conn = mem_conn();
        create_profile(&conn, &NewProfile::new("p1", "m")).expect("create");
        assert!(!delete_profile(&conn, "NoSuchProfile").expect("delete missing"));
        assert_eq!(count_profiles(&conn).expect("count"), 1);
        assert!(delete_profile(&conn, "p1").expect("delete"));
        assert!(!profile_exists(&conn, "p1").expect("exists"));
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let conn = mem_conn();
        {
            let tx = begin_write(&conn).expect("begin");
            insert_profile_row(&tx, &NewProfile::new("ghost", "m")).expect("insert");
        }
        assert!(!profile_exists(&conn, "ghost").expect("exists"));
    }

    #[test]
    fn test_migrate_adds_missing_api_provider_column() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE model_profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL DEFAULT 'generic-chat-client',
                model_id TEXT NOT NULL,
                base_url TEXT NOT NULL DEFAULT 'https://openrouter.ai/api/v1',
                temperature REAL NOT NULL DEFAULT 0.2,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            INSERT INTO model_profiles (name, model_id, created_at, updated_at)
                VALUES ('old', 'm', 't', 't');",
        )
        .expect("seed old schema");
        migrate(&conn).expect("migrate");
        let old = get_profile(&conn, "old").expect("get").expect("exists");
        assert_eq!(old.api_provider, "OPENROUTER");
    }

    #[test]
    fn test_provider_settings_upsert() {
        let conn = mem_conn();
        assert!(get_provider_setting(&conn, "GROQ").expect("get").is_none());
        set_provider_setting(
            &conn,
            &ProviderSetting {
                provider_name: "GROQ".into(),
                is_enabled: false,
                base_url: Some("https://api.groq.com/openai/v1".into()),
            },
        )
        .expect("set");
        set_provider_setting(
            &conn,
            &ProviderSetting {
                provider_name: "GROQ".into(),
                is_enabled: true,
                base_url: None,
            },
        )
        .expect("set again");
        let all = list_provider_settings(&conn).expect("list");
        assert_eq!(all.len(), 1);
        assert!(all[0].is_enabled);
        assert!(all[0].base_url.is_none());
    }

    #[test]
    fn test_concurrent_creates_of_same_name_yield_one_winner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("profiles.db");
        migrate(&open_db(&path).expect("open")).expect("migrate");

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|i| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let conn = open_db(&path).expect("open worker");
                    barrier.wait();
                    create_profile(&conn, &NewProfile::new("shared", format!("model-{}", i)))
                        .expect("create")
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|created| *created)
            .count();
        assert_eq!(wins, 1);
        let conn = open_db(&path).expect("reopen");
        assert_eq!(count_profiles(&conn).expect("count"), 1);
    }
}
