use crate::config::session_key;
use crate::credentials::Credentials;
use crate::state::SharedState;
use crate::web::ApiError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub camera_id: u32,
    pub profile_token: String,
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub stream_id: String,
}

/// 启动流 API
/// 从档案目录解析码流地址和认证信息后启动会话，重复请求返回已有会话
pub async fn handle_start(
    State(state): State<SharedState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let (camera, profile) = state
        .config
        .find_profile(req.camera_id, &req.profile_token)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Stream not found"))?;

    let key = session_key(camera.id, &profile.token);
    let credentials = Credentials::new(&camera.username, &camera.password);
    let outcome = state
        .registry
        .start(&key, &profile.source, &credentials, profile.quality)
        .await?;

    Ok(Json(json!({
        "success": true,
        "stream_id": outcome.stream_id,
        "playlist_url": outcome.playlist_url,
        "already_running": outcome.already_running,
        "uptime": outcome.uptime,
    })))
}

/// 停止流 API
/// 会话不存在时同样返回成功，`stopped` 表示是否真的停止了一个会话
pub async fn handle_stop(
    State(state): State<SharedState>,
    Json(req): Json<StopRequest>,
) -> Json<Value> {
    let stopped = state.registry.stop(&req.stream_id).await;
    Json(json!({ "success": true, "stopped": stopped }))
}

/// 获取单个流状态 API
pub async fn stream_status(
    State(state): State<SharedState>,
    Path(stream_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let info = state.registry.status(&stream_id)?;
    Ok(Json(json!(info)))
}

/// 获取流列表 API
pub async fn all_streams(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "streams": state.registry.list_all() }))
}

/// 手动回收 API
pub async fn cleanup_streams(State(state): State<SharedState>) -> Json<Value> {
    let count = state.registry.force_cleanup().await;
    Json(json!({
        "success": true,
        "cleaned_up": count,
        "message": format!("Cleaned up {} dead stream(s)", count),
    }))
}
