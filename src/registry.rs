//! 会话注册表
//!
//! 注册表是 "会话是否在运行" 的唯一事实来源。
//! 同一个 key 上的 start/stop/恢复 通过每个 key 独立的异步锁串行化，
//! 会话表本身只在很短的临界区内加锁，进程启停等 IO 都在锁外完成。

use crate::collector;
use crate::config::{AppConfig, SessionPolicy};
use crate::credentials::{self, Credentials};
use crate::error::{Result, SessionError};
use crate::session::{playlist_url, Session, SessionInfo, SessionState, StartOutcome};
use crate::transcoder::{self, Quality, Transcoder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime};
use tokio::fs;
use tracing::{debug, error, info, warn};

pub type SessionMap = HashMap<String, Session>;

pub struct SessionRegistry {
    sessions: Mutex<SessionMap>,
    /// 每个 key 的串行化锁
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) transcoder: Transcoder,
    pub(crate) policy: SessionPolicy,
    hls_root: PathBuf,
    /// 低于该可用内存 (KB) 拒绝启动，0 表示不检查
    min_free_memory_kb: u64,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new(transcoder: Transcoder, policy: SessionPolicy, hls_root: impl Into<PathBuf>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            transcoder,
            policy,
            hls_root: hls_root.into(),
            min_free_memory_kb: 0,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let transcoder = Transcoder::new(&config.server.ffmpeg_binary, config.hls.clone());
        let mut registry = Self::new(
            transcoder,
            config.sessions.clone(),
            &config.server.hls_root,
        );
        registry.min_free_memory_kb = config.server.min_free_memory_kb;
        registry
    }

    pub fn hls_root(&self) -> &Path {
        &self.hls_root
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub(crate) fn lock_sessions(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 获取 key 对应的串行化锁
    pub(crate) fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }

    /// 清理已无会话且无人持有的 key 锁
    pub(crate) fn prune_key_locks(&self) {
        let live: Vec<String> = self.lock_sessions().keys().cloned().collect();
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|key, lock| live.contains(key) || Arc::strong_count(lock) > 1);
    }

    pub(crate) fn output_dir(&self, key: &str) -> PathBuf {
        self.hls_root.join(key)
    }

    /// 启动会话
    ///
    /// # 幂等
    /// - key 已有存活的 Running 会话时直接返回 `already_running = true`
    ///
    /// # 副作用
    /// - 清理同名的残留会话 (Dead 或进程已退出)
    /// - 残留会话不是 Dead 时沿用其重连次数
    /// - 清理并创建 HLS 输出目录
    /// - 启动转码子进程
    ///
    /// # 错误处理
    /// - key 非法、内存不足或超出会话上限时返回错误，不创建会话
    /// - FFmpeg 启动失败返回 `SpawnFailed`，不创建会话
    pub async fn start(
        &self,
        key: &str,
        source_uri: &str,
        credentials: &Credentials,
        quality: Quality,
    ) -> Result<StartOutcome> {
        validate_key(key)?;
        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;

        // 1. 检查会话是否已经在运行
        {
            let mut sessions = self.lock_sessions();
            if let Some(session) = sessions.get_mut(key) {
                if session.is_live() {
                    info!("Session [{}] is already running, reusing it", key);
                    return Ok(StartOutcome {
                        stream_id: key.to_string(),
                        playlist_url: playlist_url(key),
                        already_running: true,
                        uptime: session.uptime_secs(),
                    });
                }
            }
        }

        // 2. 检查系统内存是否足够
        self.check_memory()?;

        // 3. 检查会话上限，清掉残留会话并占位
        let output_dir = self.output_dir(key);
        let stale = {
            let mut sessions = self.lock_sessions();
            let max = self.policy.max_sessions;
            if max > 0 {
                let active = sessions
                    .iter()
                    .filter(|(k, s)| k.as_str() != key && !s.state.is_dead())
                    .count();
                if active >= max {
                    warn!("Rejecting session [{}]: limit of {} reached", key, max);
                    return Err(SessionError::CapacityExceeded(active));
                }
            }

            let stale = sessions.remove(key);
            // 只有缺失或 Dead 的会话才从零计数，否则沿用已有的重连次数
            let reconnect_count = match &stale {
                Some(session) if !session.state.is_dead() => session.reconnect_count,
                _ => 0,
            };
            let now = Instant::now();
            sessions.insert(
                key.to_string(),
                Session {
                    key: key.to_string(),
                    source_uri: credentials::strip(source_uri),
                    credentials: credentials.clone(),
                    output_dir: output_dir.clone(),
                    quality,
                    state: SessionState::Starting,
                    started_at: now,
                    started_at_wall: SystemTime::now(),
                    last_health_check_at: None,
                    reconnect_count,
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                },
            );
            stale
        };

        if let Some(stale) = stale {
            info!(
                "Cleaning up stale session [{}] ({:?})",
                key,
                stale.state.status()
            );
            if let Some(handle) = stale.state.into_process() {
                transcoder::terminate(handle, self.policy.grace_period()).await;
            }
        }

        // 4. 准备输出目录并启动 FFmpeg
        let spawned = match prepare_output_dir(&output_dir).await {
            Ok(()) => {
                info!("Starting session [{}]. HLS Output: {:?}", key, output_dir);
                let resolved =
                    credentials::inject(source_uri, &credentials.username, &credentials.password);
                self.transcoder.spawn(key, &resolved, &output_dir, quality)
            }
            Err(e) => {
                error!("Failed to prepare output dir {:?}: {}", output_dir, e);
                Err(SessionError::Io(e))
            }
        };

        // 5. 更新会话状态
        let (outcome, orphan) = {
            let mut sessions = self.lock_sessions();
            match spawned {
                Ok(handle) => match sessions.get_mut(key) {
                    Some(session) => {
                        session.state = SessionState::Running(handle);
                        session.started_at = Instant::now();
                        session.started_at_wall = SystemTime::now();
                        (
                            Ok(StartOutcome {
                                stream_id: key.to_string(),
                                playlist_url: playlist_url(key),
                                already_running: false,
                                uptime: session.uptime_secs(),
                            }),
                            None,
                        )
                    }
                    None => (Err(SessionError::NotFound(key.to_string())), Some(handle)),
                },
                Err(e) => {
                    sessions.remove(key);
                    (Err(e), None)
                }
            }
        };

        if let Some(handle) = orphan {
            warn!("Session [{}] vanished during start; terminating its process", key);
            transcoder::terminate(handle, self.policy.grace_period()).await;
        }
        outcome
    }

    /// 停止会话
    ///
    /// key 不存在时视为成功。无论能否优雅退出，会话都会被移出注册表。
    /// 返回停止前是否存在未 Dead 的会话。
    pub async fn stop(&self, key: &str) -> bool {
        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;

        let (existed, process) = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions.get_mut(key) else {
                debug!("Session [{}] not found, nothing to stop", key);
                return false;
            };
            let existed = !session.state.is_dead();
            let previous = std::mem::replace(&mut session.state, SessionState::Stopping);
            (existed, previous.into_process())
        };

        if let Some(handle) = process {
            let outcome = transcoder::terminate(handle, self.policy.grace_period()).await;
            debug!("Session [{}] transcoder terminated: {:?}", key, outcome);
        }

        self.lock_sessions().remove(key);
        info!("Session [{}] stopped.", key);
        existed
    }

    /// 停止所有会话
    pub async fn stop_all(&self) -> usize {
        let keys: Vec<String> = self.lock_sessions().keys().cloned().collect();
        let count = keys.len();
        for key in keys {
            self.stop(&key).await;
        }
        info!("Stopped all {} sessions", count);
        count
    }

    pub fn status(&self, key: &str) -> Result<SessionInfo> {
        self.lock_sessions()
            .get(key)
            .map(Session::info)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))
    }

    pub fn list_all(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self.lock_sessions().values().map(Session::info).collect();
        all.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        all
    }

    /// 手动触发一次垃圾回收，返回移除的会话数
    pub async fn force_cleanup(&self) -> usize {
        collector::collect(self).await
    }

    fn check_memory(&self) -> Result<()> {
        if self.min_free_memory_kb == 0 {
            return Ok(());
        }
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < self.min_free_memory_kb => {
                Err(SessionError::InsufficientMemory(mem.avail))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // 无法获取内存信息时仅记录警告
                warn!("Failed to check memory usage: {}", e);
                Ok(())
            }
        }
    }
}

/// 清空并重建输出目录
pub(crate) async fn prepare_output_dir(dir: &Path) -> std::io::Result<()> {
    if fs::try_exists(dir).await.unwrap_or(false) {
        let _ = fs::remove_dir_all(dir).await;
    }
    fs::create_dir_all(dir).await
}

/// key 会被用作目录名
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidKey(key.to_string()))
    }
}
