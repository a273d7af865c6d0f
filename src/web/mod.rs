pub mod api;
pub mod hls;

use crate::error::SessionError;
use crate::state::SharedState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// 注册 HTTP 路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/streams/start", post(api::handle_start)) // 启动流
        .route("/api/streams/stop", post(api::handle_stop)) // 停止流
        .route("/api/streams/status/:stream_id", get(api::stream_status)) // 流状态
        .route("/api/streams/all", get(api::all_streams)) // 获取流列表
        .route("/api/streams/cleanup", post(api::cleanup_streams)) // 手动回收
        .route(
            "/static/streams/:stream_id/:file_name",
            get(hls::serve_hls_file), // 获取HLS文件
        )
        .with_state(state)
}

/// 接口错误，统一输出 `{"error": "..."}`
pub struct ApiError(StatusCode, String);

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self(status, message.into())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            SessionError::CapacityExceeded(_) | SessionError::InsufficientMemory(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SessionError::SpawnFailed { .. } | SessionError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}
