use crate::transcoder::Quality;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionPolicy,
    #[serde(default)]
    pub hls: HlsConfig,
    /// 摄像头与码流档案目录 (只读)
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub ffmpeg_binary: String,

    /// HLS 切片存储根目录
    /// 建议配置为 /dev/shm/vtx-hls 以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: String,

    /// 健康巡检间隔
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// 垃圾回收间隔
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    /// 可用内存低于该值 (KB) 时拒绝启动新会话，0 表示不检查
    #[serde(default = "default_min_free_memory_kb")]
    pub min_free_memory_kb: u64,
}

/// 会话监管策略
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionPolicy {
    /// 自动恢复的最大次数，用尽后会话进入 Dead
    pub max_retries: u32,
    /// 超过该时长 (毫秒) 没有新切片即视为不健康
    pub stale_threshold_ms: u64,
    /// SIGTERM 之后等待退出的时间，超时则强杀
    pub grace_period_ms: u64,
    /// 孤立输出目录的保留时间
    pub retention_sec: u64,
    /// 并发会话上限 (0 表示不限制)
    pub max_sessions: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stale_threshold_ms: 20_000,
            grace_period_ms: 5000,
            retention_sec: 24 * 3600,
            max_sessions: 16,
        }
    }
}

impl SessionPolicy {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_sec)
    }
}

/// HLS 输出参数 (低延迟)
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HlsConfig {
    pub segment_duration_sec: u32,
    pub playlist_size: u32,
    pub rtsp_transport: String,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_duration_sec: 2,
            playlist_size: 6,
            rtsp_transport: "tcp".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    pub id: u32,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfileConfig {
    pub token: String,
    /// 码流地址，可不带认证信息
    pub source: String,
    /// 画质：`copy`、`!preset low` 或 `!max_bitrate_kbps 800`
    #[serde(default)]
    pub quality: Quality,
    /// 启动时自动拉流
    #[serde(default)]
    pub auto_start: bool,
}

fn default_hls_root() -> String {
    "./static/streams".to_string()
}

fn default_health_interval_ms() -> u64 {
    10_000
}

fn default_gc_interval_ms() -> u64 {
    300_000
}

fn default_min_free_memory_kb() -> u64 {
    5120
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// 按 (摄像头, 档案) 查找配置
    pub fn find_profile(
        &self,
        camera_id: u32,
        token: &str,
    ) -> Option<(&CameraConfig, &ProfileConfig)> {
        let camera = self.cameras.iter().find(|c| c.id == camera_id)?;
        let profile = camera.profiles.iter().find(|p| p.token == token)?;
        Some((camera, profile))
    }
}

/// 会话键：`camera{id}_{token}`
pub fn session_key(camera_id: u32, token: &str) -> String {
    format!("camera{}_{}", camera_id, token)
}
