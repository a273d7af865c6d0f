//! 垃圾回收
//!
//! 移除 Dead 会话及其输出目录，清理不属于任何会话的目录，
//! 以及根目录下超过保留期的零散文件。
//! 已注册会话 (Running / Recovering / Starting / Stopping) 的产物不会被触碰。

use crate::registry::SessionRegistry;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 启动后台垃圾回收任务
pub async fn start_collector(
    registry: Arc<SessionRegistry>,
    interval_ms: u64,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    // 第一次 tick 立即触发，跳过
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Collector shutting down");
                break;
            }
            _ = interval.tick() => {
                let count = collect(&registry).await;
                if count > 0 {
                    info!("Periodic cleanup: removed {} dead session(s)", count);
                }
            }
        }
    }
}

/// 执行一次回收，返回移除的会话数
pub async fn collect(registry: &SessionRegistry) -> usize {
    let dead: Vec<String> = registry
        .lock_sessions()
        .iter()
        .filter(|(_, s)| s.state.is_dead())
        .map(|(key, _)| key.clone())
        .collect();

    let mut removed = 0;
    for key in dead {
        // 该 key 正在 start/stop 时跳过，下次再回收
        let key_lock = registry.key_lock(&key);
        let Ok(_guard) = key_lock.try_lock() else {
            debug!("Session [{}] is busy, skipping collection", key);
            continue;
        };

        let evicted = {
            let mut sessions = registry.lock_sessions();
            match sessions.get(&key) {
                Some(session) if session.state.is_dead() => sessions.remove(&key),
                _ => None,
            }
        };

        if let Some(session) = evicted {
            removed += 1;
            remove_dir(&session.output_dir).await;
            info!("Collected dead session [{}]", key);
        }
    }

    sweep_orphans(registry).await;
    registry.prune_key_locks();
    removed
}

/// 清理不属于任何会话的目录，以及超过保留期的零散文件
async fn sweep_orphans(registry: &SessionRegistry) {
    let root = registry.hls_root();
    let retention = registry.policy().retention();
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("HLS root {:?} not readable: {}", root, e);
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else {
            continue;
        };

        if !meta.is_dir() {
            let expired = meta.modified().map(|m| is_expired(m, retention)).unwrap_or(false);
            if expired {
                match fs::remove_file(&path).await {
                    Ok(()) => debug!("Removed old artifact: {:?}", path),
                    Err(e) => warn!("Failed to remove {:?}: {}", path, e),
                }
            }
            continue;
        }

        let key = entry.file_name().to_string_lossy().into_owned();
        if registry.lock_sessions().contains_key(&key) {
            continue;
        }

        let key_lock = registry.key_lock(&key);
        let Ok(_guard) = key_lock.try_lock() else {
            continue;
        };
        // 拿到锁后再确认一次，避免与 start() 竞争
        if registry.lock_sessions().contains_key(&key) {
            continue;
        }

        remove_dir(&path).await;
        info!("Removed orphaned output directory {:?}", path);
    }
}

fn is_expired(modified: SystemTime, retention: Duration) -> bool {
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= retention)
        .unwrap_or(false)
}

async fn remove_dir(path: &Path) {
    match fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HlsConfig, SessionPolicy};
    use crate::credentials::Credentials;
    use crate::session::SessionStatus;
    use crate::supervisor;
    use crate::test_support::{fake_transcoder, wait_for_file};
    use crate::transcoder::{Quality, Transcoder};

    fn registry(bin: &Path, root: &Path, policy: SessionPolicy) -> Arc<SessionRegistry> {
        let transcoder = Transcoder::new(fake_transcoder(bin), HlsConfig::default());
        Arc::new(SessionRegistry::new(transcoder, policy, root))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_collects_only_dead_sessions() {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let policy = SessionPolicy {
            max_retries: 0,
            ..SessionPolicy::default()
        };
        let registry = registry(bin.path(), root.path(), policy);
        let creds = Credentials::new("op", "secret");

        registry
            .start("live", "rtsp://host/ch1", &creds, Quality::Copy)
            .await
            .unwrap();
        registry
            .start("doomed", "rtsp://host/crash", &creds, Quality::Copy)
            .await
            .unwrap();
        wait_for_file(&root.path().join("live").join("index.m3u8")).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        supervisor::run_once(&registry).await;
        assert_eq!(registry.status("doomed").unwrap().state, SessionStatus::Dead);
        assert_eq!(registry.status("live").unwrap().state, SessionStatus::Running);

        assert_eq!(registry.force_cleanup().await, 1);
        assert!(registry.status("doomed").is_err());
        assert!(!root.path().join("doomed").exists());

        assert_eq!(registry.status("live").unwrap().state, SessionStatus::Running);
        assert!(root.path().join("live").join("index.m3u8").exists());

        assert_eq!(registry.force_cleanup().await, 0);
        registry.stop("live").await;
    }

    #[tokio::test]
    async fn test_orphan_directories_are_removed_on_next_pass() {
        let root = tempfile::tempdir().unwrap();
        let policy = SessionPolicy {
            retention_sec: 3600,
            ..SessionPolicy::default()
        };
        let transcoder = Transcoder::new("ffmpeg", HlsConfig::default());
        let registry = SessionRegistry::new(transcoder, policy, root.path());

        let orphan = root.path().join("camera9_old");
        std::fs::create_dir_all(&orphan).unwrap();
        std::fs::write(orphan.join("segment_00001.ts"), b"x").unwrap();
        let stray = root.path().join("notes.txt");
        std::fs::write(&stray, b"x").unwrap();

        assert_eq!(registry.force_cleanup().await, 0);
        assert!(!orphan.exists());
        // 零散文件仍在保留期内
        assert!(stray.exists());

        let policy = SessionPolicy {
            retention_sec: 0,
            ..SessionPolicy::default()
        };
        let transcoder = Transcoder::new("ffmpeg", HlsConfig::default());
        let registry = SessionRegistry::new(transcoder, policy, root.path());
        registry.force_cleanup().await;
        assert!(!stray.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stopped_session_output_is_collected() {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let registry = registry(bin.path(), root.path(), SessionPolicy::default());
        let creds = Credentials::new("op", "secret");

        registry
            .start("cam", "rtsp://host/ch1", &creds, Quality::Copy)
            .await
            .unwrap();
        let playlist = root.path().join("cam").join("index.m3u8");
        wait_for_file(&playlist).await;

        assert!(registry.stop("cam").await);
        assert!(playlist.exists());

        assert_eq!(registry.force_cleanup().await, 0);
        assert!(!root.path().join("cam").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recovering_session_is_left_alone() {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let registry = registry(bin.path(), root.path(), SessionPolicy::default());
        let creds = Credentials::new("op", "secret");

        registry
            .start("cam", "rtsp://host/ch1", &creds, Quality::Copy)
            .await
            .unwrap();
        let pid = registry.status("cam").unwrap().pid.unwrap();

        // 转码器消失后重启失败，会话停在 Recovering
        std::fs::remove_file(bin.path().join("fake-ffmpeg.sh")).unwrap();
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor::run_once(&registry).await;
        assert_eq!(registry.status("cam").unwrap().state, SessionStatus::Recovering);

        assert_eq!(registry.force_cleanup().await, 0);
        let info = registry.status("cam").unwrap();
        assert_eq!(info.state, SessionStatus::Recovering);
        assert_eq!(info.reconnect_count, 1);
        assert!(root.path().join("cam").exists());

        assert!(registry.stop("cam").await);
    }

    #[tokio::test]
    async fn test_missing_root_is_tolerated() {
        let root = tempfile::tempdir().unwrap();
        let transcoder = Transcoder::new("ffmpeg", HlsConfig::default());
        let registry = SessionRegistry::new(
            transcoder,
            SessionPolicy::default(),
            root.path().join("does-not-exist"),
        );
        assert_eq!(collect(&registry).await, 0);
    }
}
