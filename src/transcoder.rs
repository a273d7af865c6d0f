//! 转码进程监管
//!
//! 每个会话独占一个 FFmpeg 子进程：这里负责构造参数、启动、探活和终止。

use crate::config::HlsConfig;
use crate::credentials;
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// 播放列表文件名
pub const PLAYLIST_NAME: &str = "index.m3u8";
/// 切片文件名模板
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";

/// 画质档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// 直接复制视频流，不重新编码
    #[default]
    Copy,
    Preset(QualityPreset),
    /// 限制码率重新编码
    MaxBitrateKbps(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    High,
    Medium,
    Low,
}

impl QualityPreset {
    /// (码率上限 kbps, 最大高度)
    fn limits(self) -> (u32, Option<u32>) {
        match self {
            QualityPreset::High => (4000, None),
            QualityPreset::Medium => (2000, Some(720)),
            QualityPreset::Low => (800, Some(480)),
        }
    }
}

/// FFmpeg 启动器
#[derive(Debug, Clone)]
pub struct Transcoder {
    binary: String,
    hls: HlsConfig,
}

impl Transcoder {
    pub fn new(binary: impl Into<String>, hls: HlsConfig) -> Self {
        Self {
            binary: binary.into(),
            hls,
        }
    }

    /// 构造 FFmpeg 参数，`source_uri` 应已注入认证信息
    pub fn build_args(&self, source_uri: &str, output_dir: &Path, quality: Quality) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-y", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if source_uri.starts_with("rtsp://") || source_uri.starts_with("rtsps://") {
            args.push("-rtsp_transport".into());
            args.push(self.hls.rtsp_transport.clone());
        }
        args.push("-i".into());
        args.push(source_uri.to_string());

        let limits = match quality {
            Quality::Copy => None,
            Quality::Preset(preset) => Some(preset.limits()),
            Quality::MaxBitrateKbps(kbps) => Some((kbps, None)),
        };

        match limits {
            None => {
                args.push("-c:v".into());
                args.push("copy".into());
            }
            Some((kbps, max_height)) => {
                if let Some(height) = max_height {
                    args.push("-vf".into());
                    args.push(format!("scale=-2:'min({},ih)'", height));
                }
                args.extend(
                    [
                        "-c:v",
                        "libx264",
                        "-preset",
                        "veryfast",
                        "-tune",
                        "zerolatency",
                    ]
                    .iter()
                    .map(|s| s.to_string()),
                );
                args.push("-b:v".into());
                args.push(format!("{}k", kbps));
                args.push("-maxrate".into());
                args.push(format!("{}k", kbps));
                args.push("-bufsize".into());
                args.push(format!("{}k", kbps.saturating_mul(2)));
                // 关键帧与切片边界对齐
                args.push("-force_key_frames".into());
                args.push(format!(
                    "expr:gte(t,n_forced*{})",
                    self.hls.segment_duration_sec
                ));
            }
        }

        args.push("-c:a".into());
        args.push("aac".into());

        let dir = output_dir.to_string_lossy();
        args.extend([
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            self.hls.segment_duration_sec.to_string(),
            "-hls_list_size".to_string(),
            self.hls.playlist_size.to_string(),
            "-hls_flags".to_string(),
            "delete_segments+omit_endlist".to_string(),
            "-hls_allow_cache".to_string(),
            "0".to_string(),
            "-hls_segment_filename".to_string(),
            format!("{}/{}", dir, SEGMENT_PATTERN),
            "-start_number".to_string(),
            "0".to_string(),
            format!("{}/{}", dir, PLAYLIST_NAME),
        ]);
        args
    }

    /// 启动转码进程
    ///
    /// # 错误处理
    /// - 可执行文件不存在或无法启动时返回 `SpawnFailed`
    pub fn spawn(
        &self,
        key: &str,
        source_uri: &str,
        output_dir: &Path,
        quality: Quality,
    ) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.build_args(source_uri, output_dir, quality));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn transcoder for [{}]: {}", key, e);
            SessionError::SpawnFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })?;

        // 持续读取 stderr，避免管道写满导致子进程阻塞
        if let Some(stderr) = child.stderr.take() {
            let key = key.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] ffmpeg: {}", key, credentials::redact(&line));
                }
            });
        }

        let pid = child.id();
        info!(
            "Transcoder for [{}] spawned (pid {:?}) from {}",
            key,
            pid,
            credentials::redact(source_uri)
        );

        Ok(ProcessHandle {
            child,
            pid,
            output_dir: output_dir.to_path_buf(),
            spawned_at: SystemTime::now(),
        })
    }
}

/// 转码进程句柄，由会话独占
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    output_dir: PathBuf,
    spawned_at: SystemTime,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spawned_at(&self) -> SystemTime {
        self.spawned_at
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 非阻塞地检查进程是否仍在运行
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Transcoder pid {:?} exited with: {}", self.pid, status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!("Process monitor error (pid {:?}): {}", self.pid, e);
                true
            }
        }
    }

    /// 距离最近一次输出文件写入的时间
    pub fn since_last_output(&self) -> Duration {
        output_age(&self.output_dir, self.spawned_at)
    }
}

/// 输出目录中最新文件的年龄
///
/// 以 `since` 为下限，刚启动还没有切片的进程不会被判定为过期。
pub fn output_age(output_dir: &Path, since: SystemTime) -> Duration {
    let newest = newest_mtime(output_dir).map_or(since, |mtime| mtime.max(since));
    SystemTime::now()
        .duration_since(newest)
        .unwrap_or(Duration::ZERO)
}

fn newest_mtime(dir: &Path) -> Option<SystemTime> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .filter_map(|meta| meta.modified().ok())
        .max()
}

/// 终止结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// 调用前进程已退出
    AlreadyExited,
    /// 宽限期内正常退出
    Graceful,
    /// 超时后强制结束
    Killed,
    /// 强杀也失败
    Failed,
}

/// 终止转码进程
///
/// 先发送 SIGTERM，超过 `grace` 仍未退出则 SIGKILL 并等待回收。
/// 返回时进程已经退出，或强杀路径已经用尽。
pub async fn terminate(mut handle: ProcessHandle, grace: Duration) -> TerminateOutcome {
    let pid = handle.pid;
    if let Ok(Some(_)) = handle.child.try_wait() {
        return TerminateOutcome::AlreadyExited;
    }

    match pid.map(send_sigterm) {
        Some(Ok(())) => match tokio::time::timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Transcoder pid {:?} exited gracefully: {}", pid, status);
                return TerminateOutcome::Graceful;
            }
            Ok(Err(e)) => warn!("Wait on transcoder pid {:?} failed: {}", pid, e),
            Err(_) => warn!(
                "Transcoder pid {:?} did not exit within {:?}, killing",
                pid, grace
            ),
        },
        Some(Err(e)) => warn!("Failed to signal transcoder pid {:?}: {}", pid, e),
        None => {}
    }

    // kill() 会发送 SIGKILL 并等待回收
    match tokio::time::timeout(grace.max(Duration::from_secs(1)), handle.child.kill()).await {
        Ok(Ok(())) => TerminateOutcome::Killed,
        Ok(Err(e)) => {
            error!("FATAL: failed to kill transcoder pid {:?}: {}", pid, e);
            TerminateOutcome::Failed
        }
        Err(_) => {
            error!("FATAL: transcoder pid {:?} survived SIGKILL", pid);
            TerminateOutcome::Failed
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid_t: libc::pid_t = pid.try_into().map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "PID out of range")
    })?;

    let result = unsafe { libc::kill(pid_t, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful stop is not supported on this platform",
    ))
}
