use crate::session::SessionStatus;
use crate::state::SharedState;
use crate::web::ApiError;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

/// 提供播放列表与切片文件
///
/// 文件由转码进程持续改写，响应一律禁止缓存。
pub async fn serve_hls_file(
    State(state): State<SharedState>,
    Path((stream_id, file_name)): Path<(String, String)>,
) -> Result<Response<Body>, ApiError> {
    // 1. Reject anything that could escape the session directory
    if [stream_id.as_str(), file_name.as_str()]
        .iter()
        .any(|part| part.contains("..") || part.contains('/') || part.contains('\\'))
    {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Invalid path"));
    }

    // 2. Construct the file path (reading from the configured HLS Root directory, supports RAMDisk)
    let file_path = state.registry.hls_root().join(&stream_id).join(&file_name);

    // 3. Wait for the playlist to be generated while the session is coming up
    if file_name.ends_with(".m3u8") {
        let pending = matches!(
            state.registry.status(&stream_id).map(|info| info.state),
            Ok(SessionStatus::Starting | SessionStatus::Running | SessionStatus::Recovering)
        );
        if pending {
            for i in 0..15 {
                if tokio::fs::try_exists(&file_path).await.unwrap_or(false) {
                    break;
                }
                if i == 0 {
                    info!("Waiting for HLS generation: {:?}", file_path);
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    // 4. Open the file for reading
    let file = File::open(&file_path)
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "File not found"))?;

    // 5. Determine the Content-Type based on the file extension
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .map_err(|e| {
            error!("Failed to build HLS response: {}", e);
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}
