use crate::credentials;
use crate::registry::{prepare_output_dir, SessionRegistry};
use crate::session::SessionState;
use crate::transcoder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单个会话一次巡检的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// 会话已不在巡检范围内 (被停止、移除或仍在启动)
    Skipped,
    Healthy,
    /// 已重启替换进程
    Recovered,
    /// 重启失败，下个周期重试
    RecoveryFailed,
    /// 重试用尽，标记为 Dead
    MarkedDead,
}

/// 启动后台健康巡检任务，定期检查会话状态并进行故障恢复
///
/// # 任务流程：
/// - 每隔指定的时间间隔扫描所有 Running / Recovering 会话
/// - 进程退出或超过阈值没有新切片即判定为不健康
/// - 不健康且未超过重试上限时重启进程，否则标记为 Dead
/// - 收到取消信号后退出
pub async fn start_health_monitor(
    registry: Arc<SessionRegistry>,
    interval_ms: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Health monitor shutting down");
                break;
            }
            _ = interval.tick() => {
                run_once(&registry).await;
            }
        }
    }
}

/// 执行一轮巡检
///
/// 各会话并发检查，一个会话的慢速终止不会拖住其他会话。
pub async fn run_once(registry: &Arc<SessionRegistry>) -> Vec<(String, HealthVerdict)> {
    let candidates: Vec<String> = registry
        .lock_sessions()
        .iter()
        .filter(|(_, s)| {
            matches!(
                s.state,
                SessionState::Running(_) | SessionState::Recovering
            )
        })
        .map(|(key, _)| key.clone())
        .collect();

    let mut tasks = JoinSet::new();
    for key in candidates {
        let registry = registry.clone();
        tasks.spawn(async move {
            let verdict = check_session(&registry, &key).await;
            (key, verdict)
        });
    }

    let mut verdicts = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => verdicts.push(result),
            Err(e) => error!("Health check task failed: {}", e),
        }
    }
    verdicts
}

struct Observed {
    alive: bool,
    output_dir: PathBuf,
    spawned_at: SystemTime,
}

/// 检查并在需要时恢复单个会话
pub async fn check_session(registry: &SessionRegistry, key: &str) -> HealthVerdict {
    let key_lock = registry.key_lock(key);
    let _guard = key_lock.lock().await;
    let policy = registry.policy().clone();

    // --- 阶段 1: 在锁内探测进程状态 ---
    let observed = {
        let mut sessions = registry.lock_sessions();
        let Some(session) = sessions.get_mut(key) else {
            return HealthVerdict::Skipped;
        };
        match &mut session.state {
            SessionState::Running(handle) => Observed {
                alive: handle.is_alive(),
                output_dir: handle.output_dir().to_path_buf(),
                spawned_at: handle.spawned_at(),
            },
            SessionState::Recovering => Observed {
                alive: false,
                output_dir: session.output_dir.clone(),
                spawned_at: SystemTime::now(),
            },
            // 启动中、停止中或已 Dead 的会话不做处理
            _ => return HealthVerdict::Skipped,
        }
    };

    // --- 阶段 2: 锁外检查切片新鲜度 ---
    let age = transcoder::output_age(&observed.output_dir, observed.spawned_at);
    if observed.alive && age < policy.stale_threshold() {
        if let Some(session) = registry.lock_sessions().get_mut(key) {
            session.last_health_check_at = Some(Instant::now());
        }
        return HealthVerdict::Healthy;
    }

    // --- 阶段 3: 不健康，摘下旧进程 ---
    let (process, exhausted) = {
        let mut sessions = registry.lock_sessions();
        let Some(session) = sessions.get_mut(key) else {
            return HealthVerdict::Skipped;
        };
        session.last_health_check_at = Some(Instant::now());
        let exhausted = session.reconnect_count >= policy.max_retries;
        let next = if exhausted {
            SessionState::Dead {
                reason: format!(
                    "recovery exhausted after {} attempts",
                    session.reconnect_count
                ),
            }
        } else {
            SessionState::Recovering
        };
        let previous = std::mem::replace(&mut session.state, next);
        (previous.into_process(), exhausted)
    };

    if observed.alive {
        warn!(
            "Session [{}] stalled: no output for {}s",
            key,
            age.as_secs()
        );
    } else {
        warn!("Session [{}] transcoder is not running", key);
    }

    if let Some(handle) = process {
        transcoder::terminate(handle, policy.grace_period()).await;
    }

    if exhausted {
        error!(
            "Session [{}] reached max retry attempts ({}). Marking dead.",
            key, policy.max_retries
        );
        return HealthVerdict::MarkedDead;
    }

    // --- 阶段 4: 用原始地址重新注入认证信息并重启 ---
    let (source_uri, creds, output_dir, quality) = {
        let sessions = registry.lock_sessions();
        let Some(session) = sessions.get(key) else {
            return HealthVerdict::Skipped;
        };
        (
            session.source_uri.clone(),
            session.credentials.clone(),
            session.output_dir.clone(),
            session.quality,
        )
    };

    let resolved = credentials::inject(&source_uri, &creds.username, &creds.password);
    let spawned = match prepare_output_dir(&output_dir).await {
        Ok(()) => registry
            .transcoder
            .spawn(key, &resolved, &output_dir, quality),
        Err(e) => Err(e.into()),
    };

    let (verdict, orphan) = {
        let mut sessions = registry.lock_sessions();
        match sessions.get_mut(key) {
            Some(session) => {
                session.reconnect_count += 1;
                match spawned {
                    Ok(handle) => {
                        session.state = SessionState::Running(handle);
                        info!(
                            "Session [{}] recovered. Retry {}/{}.",
                            key, session.reconnect_count, policy.max_retries
                        );
                        (HealthVerdict::Recovered, None)
                    }
                    Err(e) => {
                        warn!(
                            "Session [{}] restart {}/{} failed: {}. Retrying next tick.",
                            key, session.reconnect_count, policy.max_retries, e
                        );
                        (HealthVerdict::RecoveryFailed, None)
                    }
                }
            }
            None => (HealthVerdict::Skipped, spawned.ok()),
        }
    };

    if let Some(handle) = orphan {
        warn!("Session [{}] vanished during recovery; terminating its process", key);
        transcoder::terminate(handle, policy.grace_period()).await;
    }
    verdict
}
