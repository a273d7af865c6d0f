#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vtx_relay::config::{HlsConfig, SessionPolicy};
use vtx_relay::transcoder::Transcoder;
use vtx_relay::{collector, supervisor};
use vtx_relay::{Credentials, Quality, SessionRegistry, SessionStatus};

/// 只会不停刷新播放列表的假转码器
const FAKE_FFMPEG: &str = r##"#!/bin/sh
for last; do :; done
dir=$(dirname "$last")
while :; do
  : > "$dir/segment_00000.ts"
  echo "#EXTM3U" > "$last"
  sleep 0.1
done
"##;

fn write_fake(dir: &Path) -> String {
    let path = dir.join("fake-ffmpeg.sh");
    std::fs::write(&path, FAKE_FFMPEG).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_band_kill_is_recovered_by_background_monitor() {
    let bin = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let policy = SessionPolicy {
        grace_period_ms: 500,
        ..SessionPolicy::default()
    };
    let registry = Arc::new(SessionRegistry::new(
        Transcoder::new(write_fake(bin.path()), HlsConfig::default()),
        policy,
        root.path(),
    ));

    let interval_ms = 200;
    let cancel = CancellationToken::new();
    let monitor = tokio::spawn(supervisor::start_health_monitor(
        registry.clone(),
        interval_ms,
        cancel.clone(),
    ));
    let gc = tokio::spawn(collector::start_collector(
        registry.clone(),
        50,
        cancel.clone(),
    ));

    let creds = Credentials::new("op", "secret");
    let outcome = registry
        .start("camera1_main", "rtsp://10.0.0.5:554/ch1", &creds, Quality::Copy)
        .await
        .unwrap();
    assert!(!outcome.already_running);

    let pid = registry.status("camera1_main").unwrap().pid.unwrap();
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    // 两个巡检周期内完成替换
    tokio::time::sleep(Duration::from_millis(interval_ms * 2 + 100)).await;
    let info = registry.status("camera1_main").unwrap();
    assert_eq!(info.state, SessionStatus::Running);
    assert_eq!(info.reconnect_count, 1);
    assert_ne!(info.pid, Some(pid));

    // 回收任务不会碰运行中的会话
    assert_eq!(registry.list_all().len(), 1);
    assert!(root.path().join("camera1_main").exists());

    assert!(registry.stop("camera1_main").await);
    assert!(registry.list_all().is_empty());
    assert!(!registry.stop("camera1_main").await);

    cancel.cancel();
    monitor.await.unwrap();
    gc.await.unwrap();
}

#[tokio::test]
async fn test_status_of_unknown_session() {
    let root = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(
        Transcoder::new("ffmpeg", HlsConfig::default()),
        SessionPolicy::default(),
        root.path(),
    );
    assert!(registry.status("nope").is_err());
    assert_eq!(registry.force_cleanup().await, 0);
}
