use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::{
    config::Settings,
    models::{ModelProfile, NewProfile, ProfileUpdate, ProviderSetting},
    session::Session,
    telemetry,
};

type ApiError = (StatusCode, String);

#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
}

impl AppState {
    /**
     * \brief 每个请求独立会话，只共享底层数据库文件。
     */
    fn session(&self) -> Result<Session, ApiError> {
        Session::open(&self.settings).map_err(internal_err)
    }
}

/**
 * \brief 构建 HTTP 路由。
 */
pub fn router(settings: Settings) -> Router {
    let state = AppState {
        settings: Arc::new(settings),
    };
    Router::new()
        .route("/api/profiles", get(list_profiles).post(create_profile))
        .route(
            "/api/profiles/{name}",
            get(get_profile).put(update_profile).delete(delete_profile),
        )
        .route("/api/profiles/{name}/resolve", get(resolve_profile))
        .route("/api/credentials", get(credential_status))
        .route("/api/providers", get(list_provider_settings))
        .route(
            "/api/providers/{name}",
            get(get_provider_setting).put(put_provider_setting),
        )
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, settings: Settings) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, router(settings)).await?;
    Ok(())
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ProfilesState {
    /** \brief 存储层中的配置 */
    pub profiles: Vec<ModelProfile>,
    /** \brief 可供选择的全部配置名（内置 + 存储） */
    pub available: Vec<String>,
}

/**
 * \brief 对外展示的解析结果；API Key 只报告是否存在。
 */
#[derive(Serialize, Deserialize, Debug)]
pub struct ResolvedView {
    pub name: String,
    pub provider: String,
    pub model_id: String,
    pub base_url: String,
    pub temperature: f64,
    pub api_provider: String,
    pub has_api_key: bool,
}

#[derive(Deserialize, Debug)]
struct ProviderSettingRequest {
    #[serde(default = "enabled_by_default")]
    is_enabled: bool,
    #[serde(default)]
    base_url: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

fn build_profiles_state(session: &Session) -> Result<ProfilesState, ApiError> {
    let profiles = session.list_profiles().map_err(internal_err)?;
    let available = session.available_profiles().map_err(internal_err)?;
    Ok(ProfilesState {
        profiles: profiles.as_ref().clone(),
        available,
    })
}

/**
 * \brief 获取配置列表。
 */
async fn list_profiles(State(state): State<AppState>) -> Result<Json<ProfilesState>, ApiError> {
    let session = state.session()?;
    Ok(Json(build_profiles_state(&session)?))
}

/**
 * \brief 新增配置；同名已存在时返回 409。
 */
async fn create_profile(
    State(state): State<AppState>,
    Json(payload): Json<NewProfile>,
) -> Result<(StatusCode, Json<ProfilesState>), ApiError> {
    if payload.name.trim().is_empty() || payload.model_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "name and model_id are required".to_string(),
        ));
    }
    let session = state.session()?;
    if !session.create_profile(&payload).map_err(internal_err)? {
        return Err((
            StatusCode::CONFLICT,
            format!("Model Display Name '{}' already exists", payload.name.trim()),
        ));
    }
    telemetry::log_event(
        "server.profile",
        &format!("create name={} model={}", payload.name, payload.model_id),
    );
    Ok((StatusCode::CREATED, Json(build_profiles_state(&session)?)))
}

async fn get_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ModelProfile>, ApiError> {
    let session = state.session()?;
    session
        .get_profile(&name)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found(&name))
}

/**
 * \brief 局部更新配置。
 */
async fn update_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<ProfileUpdate>,
) -> Result<Json<ModelProfile>, ApiError> {
    let session = state.session()?;
    if !session.update_profile(&name, &payload).map_err(internal_err)? {
        return Err(not_found(&name));
    }
    telemetry::log_event("server.profile", &format!("update name={}", name));
    session
        .get_profile(&name)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found(&name))
}

/**
 * \brief 删除配置。
 */
async fn delete_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProfilesState>, ApiError> {
    let session = state.session()?;
    if !session.delete_profile(&name).map_err(internal_err)? {
        return Err(not_found(&name));
    }
    telemetry::log_event("server.profile", &format!("delete name={}", name));
    Ok(Json(build_profiles_state(&session)?))
}

/**
 * \brief 解析配置；未知名称同样返回默认配置。
 */
async fn resolve_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ResolvedView>, ApiError> {
    let session = state.session()?;
    let resolved = session.resolve_profile(&name);
    Ok(Json(ResolvedView {
        has_api_key: resolved.has_credential(),
        name: resolved.name,
        provider: resolved.provider,
        model_id: resolved.model_id,
        base_url: resolved.base_url,
        temperature: resolved.temperature,
        api_provider: resolved.api_provider,
    }))
}

/**
 * \brief 各已知凭据是否可用（不返回值本身）。
 */
async fn credential_status(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, bool>>, ApiError> {
    let session = state.session()?;
    Ok(Json(
        session
            .credential_set()
            .into_iter()
            .map(|(key, value)| (key, !value.is_empty()))
            .collect(),
    ))
}

async fn list_provider_settings(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProviderSetting>>, ApiError> {
    let session = state.session()?;
    Ok(Json(session.provider_settings().map_err(internal_err)?))
}

async fn get_provider_setting(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProviderSetting>, ApiError> {
    let session = state.session()?;
    session
        .provider_setting(&name.to_ascii_uppercase())
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found(&name))
}

async fn put_provider_setting(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<ProviderSettingRequest>,
) -> Result<Json<ProviderSetting>, ApiError> {
    let session = state.session()?;
    let setting = ProviderSetting {
        provider_name: name.to_ascii_uppercase(),
        is_enabled: payload.is_enabled,
        base_url: payload.base_url.filter(|u| !u.trim().is_empty()),
    };
    session.set_provider_setting(&setting).map_err(internal_err)?;
    telemetry::log_event(
        "server.provider",
        &format!("set name={} enabled={}", setting.provider_name, setting.is_enabled),
    );
    Ok(Json(setting))
}

/**
 * \brief 健康检查：确认存储可读。
 */
async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.session()?;
    match session.list_profiles() {
        Ok(profiles) => Ok(Json(serde_json::json!({
            "ok": true,
            "profiles": profiles.len(),
            "telemetry_enabled": session.telemetry_enabled().unwrap_or(false),
        }))),
        Err(e) => {
            telemetry::log_error("server.health", &format!("store unavailable: {}", e));
            Ok(Json(serde_json::json!({
                "ok": false,
                "error": e.to_string(),
            })))
        }
    }
}

fn not_found(name: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("'{}' not found", name))
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
