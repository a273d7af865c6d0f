use crate::credentials::Credentials;
use crate::transcoder::{ProcessHandle, Quality, PLAYLIST_NAME};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 播放地址前缀，由 HTTP 层负责提供静态文件
pub const PLAYLIST_URL_PREFIX: &str = "/static/streams";

/// 会话状态
///
/// 只有 `Running` 持有进程句柄，`Dead` 会话不可能再关联存活的进程。
#[derive(Debug)]
pub enum SessionState {
    Starting,
    Running(ProcessHandle),
    /// 旧进程已终止，等待 (或正在) 重启
    Recovering,
    Stopping,
    Dead { reason: String },
}

/// 对外暴露的状态标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Recovering,
    Stopping,
    Dead,
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionState::Starting => SessionStatus::Starting,
            SessionState::Running(_) => SessionStatus::Running,
            SessionState::Recovering => SessionStatus::Recovering,
            SessionState::Stopping => SessionStatus::Stopping,
            SessionState::Dead { .. } => SessionStatus::Dead,
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, SessionState::Dead { .. })
    }

    /// 取出进程句柄 (如果有)
    pub fn into_process(self) -> Option<ProcessHandle> {
        match self {
            SessionState::Running(handle) => Some(handle),
            _ => None,
        }
    }
}

/// 一个受监管的拉流会话
#[derive(Debug)]
pub struct Session {
    pub key: String,
    /// 不含认证信息的原始地址
    pub source_uri: String,
    pub credentials: Credentials,
    pub output_dir: PathBuf,
    pub quality: Quality,
    pub state: SessionState,
    pub started_at: Instant,
    pub started_at_wall: SystemTime,
    pub last_health_check_at: Option<Instant>,
    pub reconnect_count: u32,
    /// 每次全新 start() 分配一个新值，用于识别同名的不同会话
    pub generation: u64,
}

impl Session {
    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Running 且进程仍然存活
    pub fn is_live(&mut self) -> bool {
        match &mut self.state {
            SessionState::Running(handle) => handle.is_alive(),
            _ => false,
        }
    }

    pub fn info(&self) -> SessionInfo {
        let (pid, dead_reason) = match &self.state {
            SessionState::Running(handle) => (handle.pid(), None),
            SessionState::Dead { reason } => (None, Some(reason.clone())),
            _ => (None, None),
        };
        let status = self.state.status();

        SessionInfo {
            stream_id: self.key.clone(),
            source_uri: self.source_uri.clone(),
            state: status,
            is_active: status == SessionStatus::Running,
            playlist_url: playlist_url(&self.key),
            quality: self.quality,
            started_at: self
                .started_at_wall
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            uptime: self.uptime_secs(),
            reconnect_count: self.reconnect_count,
            last_health_check_ago: self
                .last_health_check_at
                .map(|t| t.elapsed().as_secs_f64()),
            pid,
            dead_reason,
        }
    }
}

/// 会话快照
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub stream_id: String,
    pub source_uri: String,
    pub state: SessionStatus,
    pub is_active: bool,
    pub playlist_url: String,
    pub quality: Quality,
    /// Unix 时间戳 (秒)
    pub started_at: f64,
    /// 运行时长 (秒)
    pub uptime: f64,
    pub reconnect_count: u32,
    pub last_health_check_ago: Option<f64>,
    pub pid: Option<u32>,
    pub dead_reason: Option<String>,
}

/// start() 的结果
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub stream_id: String,
    pub playlist_url: String,
    pub already_running: bool,
    /// 运行时长 (秒)
    pub uptime: f64,
}

pub fn playlist_url(key: &str) -> String {
    format!("{}/{}/{}", PLAYLIST_URL_PREFIX, key, PLAYLIST_NAME)
}
