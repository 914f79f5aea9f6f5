use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{config::Settings, db};

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

pub const LOG_FILE_NAME: &str = "courseware.log";
const AUDIT_TARGET: &str = "courseware::audit";

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 安装全局日志订阅者。
 * \details stderr 输出受 `COURSEWARE_LOG` 控制（默认 warn）；遥测开启时额外追加写入 `<log_dir>/courseware.log`。
 *          重复调用时保留第一次安装的订阅者。
 */
pub fn init(log_dir: &Path, telemetry_enabled: bool) -> Result<()> {
    set_enabled(telemetry_enabled);

    let stderr_filter =
        EnvFilter::try_from_env("COURSEWARE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    let file_layer = if telemetry_enabled {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("create log directory {}", log_dir.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(LOG_FILE_NAME))?;
        Some(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(EnvFilter::new("info")),
        )
    } else {
        None
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
    {
        tracing::debug!("log subscriber already installed: {}", err);
    }
    Ok(())
}

/**
 * \brief 按运行配置安装日志：直接读取持久化的遥测开关，再调用 `init`。
 * \details 只做建表与读取，不触发旧版配置导入，保证导入过程的日志已有去处。
 * \return 读取到的遥测开关；配置库不可读时按关闭处理。
 */
pub fn init_from_settings(settings: &Settings) -> Result<bool> {
    let telemetry_enabled = db::open_db(&settings.db_path)
        .and_then(|conn| {
            db::migrate(&conn)?;
            db::get_telemetry_enabled(&conn)
        })
        .unwrap_or(false);
    init(&settings.log_dir, telemetry_enabled)?;
    Ok(telemetry_enabled)
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    tracing::info!(target: AUDIT_TARGET, category, "{}", message);
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    if !is_enabled() {
        return;
    }
    tracing::error!(target: AUDIT_TARGET, category, "{}", message);
}
