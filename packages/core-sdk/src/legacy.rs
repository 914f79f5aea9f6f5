use anyhow::{Context, Result};
use rusqlite::Connection;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::db;
use crate::models::LegacyProfile;

/** \brief app_config 中的导入完成标记。 */
pub const MIGRATION_MARKER_KEY: &str = "legacy_profiles_migrated";

/**
 * \brief 逐条导入旧版记录，返回成功写入的条数。
 * \details 缺少名称或模型的记录跳过；同名记录已存在时静默跳过；单条写入失败只记录日志，不中断整批。
 */
pub fn migrate_records(conn: &Connection, records: &[LegacyProfile]) -> usize {
    let mut migrated = 0;
    for (index, record) in records.iter().enumerate() {
        let Some(profile) = record.to_new_profile() else {
            tracing::warn!(index, name = %record.name, "legacy profile skipped: missing name or model");
            continue;
        };
        match db::insert_profile_row(conn, &profile) {
            Ok(true) => migrated += 1,
            Ok(false) => {
                tracing::debug!(name = %profile.name, "legacy profile already present, skipped");
            }
            Err(err) => {
                tracing::warn!(name = %profile.name, "legacy profile failed to migrate: {:#}", err);
            }
        }
    }
    migrated
}

/**
 * \brief 解析旧版文件内容。
 * \details 顶层必须是数组；单条记录字段类型不符时记录警告并跳过，其余记录照常返回。
 */
pub fn parse_records(raw: &str) -> Result<Vec<LegacyProfile>> {
    let items: Vec<Value> =
        serde_json::from_str(raw).context("legacy profiles must be a JSON array")?;
    let records = items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<LegacyProfile>(item) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(index, "legacy profile skipped: malformed record: {}", err);
                None
            }
        })
        .collect();
    Ok(records)
}

/**
 * \brief 归档后的文件名：`custom_models.json` -> `custom_models.json.migrated`。
 */
pub fn archived_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".migrated");
    PathBuf::from(name)
}

/**
 * \brief 导入旧版 JSON 文件（若存在），然后写入完成标记并归档文件。
 * \details 判断标记、写入记录、写入标记在同一个 IMMEDIATE 事务内完成，并发首次访问时只有一方真正导入。
 *          再次调用时没有可导入内容，安全返回 0。
 */
pub fn import_legacy_file(conn: &Connection, path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read legacy profiles {}", path.display()))?;
    let records = parse_records(&raw).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), "legacy profiles unreadable, archiving without import: {:#}", err);
        Vec::new()
    });

    let tx = db::begin_write(conn)?;
    let migrated = if db::get_config_value(&tx, MIGRATION_MARKER_KEY)?.is_some() {
        0
    } else {
        let migrated = migrate_records(&tx, &records);
        let marker = format!("{} count={}", db::now_timestamp()?, migrated);
        db::set_config_value(&tx, MIGRATION_MARKER_KEY, &marker)?;
        migrated
    };
    tx.commit()?;

    archive(path);
    if migrated > 0 {
        tracing::info!(migrated, path = %path.display(), "migrated legacy profiles");
    }
    Ok(migrated)
}

fn archive(path: &Path) {
    let target = archived_path(path);
    // 另一进程可能已经完成归档
    if let Err(err) = std::fs::rename(path, &target) {
        if path.exists() {
            tracing::warn!(
                from = %path.display(),
                to = %target.display(),
                "could not archive legacy profiles: {}",
                err
            );
        }
    }
}

/**
 * \brief 是否已写入完成标记。
 */
pub fn is_migrated(conn: &Connection) -> Result<bool> {
    Ok(db::get_config_value(conn, MIGRATION_MARKER_KEY)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewProfile;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::migrate(&conn).expect("migrate");
        conn
    }

    fn parse(raw: &str) -> Vec<LegacyProfile> {
        serde_json::from_str(raw).expect("parse legacy json")
    }

    #[test]
    fn test_migrate_records_counts_only_successes() {
        let conn = mem_conn();
        db::create_profile(&conn, &NewProfile::new("Taken", "m")).expect("seed");
        let records = parse(
            r#"[
                {"name":"Old1","config":{"model":"x"}},
                {"name":"","config":{"model":"y"}},
                {"name":"NoModel","config":{}},
                {"name":"Taken","config":{"model":"z"}},
                {"name":"Old2","provider":"OpenAIChatCompletionClient","api_provider":"GEMINI",
                 "config":{"model":"google/gemini-pro","base_url":"https://generativelanguage.googleapis.com/v1beta","temperature":0.5}}
            ]"#,
        );
        assert_eq!(migrate_records(&conn, &records), 2);

        let old2 = db::get_profile(&conn, "Old2").expect("get").expect("exists");
        assert_eq!(old2.provider, "OpenAIChatCompletionClient");
        assert_eq!(old2.api_provider, "GEMINI");
        assert_eq!(old2.temperature, 0.5);
        let taken = db::get_profile(&conn, "Taken").expect("get").expect("exists");
        assert_eq!(taken.model_id, "m");
    }

    #[test]
    fn test_import_is_idempotent_and_archives_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom_models.json");
        std::fs::write(&path, r#"[{"name":"Old1","config":{"model":"x"}}]"#).expect("write");
        let conn = mem_conn();

        assert_eq!(import_legacy_file(&conn, &path).expect("first import"), 1);
        assert!(!path.exists());
        assert!(archived_path(&path).exists());
        assert!(is_migrated(&conn).expect("marker"));

        // 恢复同一份文件，标记存在时不再导入
        std::fs::copy(archived_path(&path), &path).expect("restore");
        assert_eq!(import_legacy_file(&conn, &path).expect("second import"), 0);
        assert_eq!(db::count_profiles(&conn).expect("count"), 1);
        assert!(!path.exists());

        assert_eq!(import_legacy_file(&conn, &path).expect("nothing left"), 0);
    }

    #[test]
    fn test_migrated_name_blocks_later_create() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom_models.json");
        std::fs::write(&path, r#"[{"name":"Old1","config":{"model":"x"}}]"#).expect("write");
        let conn = mem_conn();
        import_legacy_file(&conn, &path).expect("import");

        let created = db::create_profile(&conn, &NewProfile::new("Old1", "other")).expect("create");
        assert!(!created);
    }

    #[test]
    fn test_unreadable_file_is_consumed_without_import() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom_models.json");
        std::fs::write(&path, "{not json").expect("write");
        let conn = mem_conn();

        assert_eq!(import_legacy_file(&conn, &path).expect("import"), 0);
        assert!(is_migrated(&conn).expect("marker"));
        assert!(archived_path(&path).exists());
    }

    #[test]
    fn test_malformed_record_does_not_drop_its_neighbours() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom_models.json");
        std::fs::write(
            &path,
            r#"[
                {"name":"Good","config":{"model":"x"}},
                {"name":"Bad","config":{"model":"y","temperature":"hot"}},
                {"name":null,"config":{"model":"z"}},
                {"name":"Also","config":{"model":"w","temperature":0.4}}
            ]"#,
        )
        .expect("write");
        let conn = mem_conn();

        assert_eq!(import_legacy_file(&conn, &path).expect("import"), 2);
        assert!(db::profile_exists(&conn, "Good").expect("exists"));
        assert!(db::profile_exists(&conn, "Also").expect("exists"));
        assert!(!db::profile_exists(&conn, "Bad").expect("exists"));
        assert!(is_migrated(&conn).expect("marker"));
    }

    #[test]
    fn test_parse_records_rejects_non_array() {
        assert!(parse_records(r#"{"name":"Old1","config":{"model":"x"}}"#).is_err());
        assert_eq!(parse_records("[]").expect("empty").len(), 0);
    }

    #[test]
    fn test_missing_provider_gets_builtin_client() {
        let conn = mem_conn();
        let records = parse(r#"[{"name":"Old1","config":{"model":"x"}}]"#);
        assert_eq!(migrate_records(&conn, &records), 1);
        let old1 = db::get_profile(&conn, "Old1").expect("get").expect("exists");
        assert_eq!(old1.provider, "OpenAIChatCompletionClient");
        assert_eq!(old1.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(old1.api_provider, "OPENROUTER");
    }

    #[test]
    fn test_missing_file_leaves_marker_unset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = mem_conn();
        assert_eq!(
            import_legacy_file(&conn, &dir.path().join("absent.json")).expect("import"),
            0
        );
        assert!(!is_migrated(&conn).expect("marker"));
    }
}
