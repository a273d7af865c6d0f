//! 测试用的假转码器
//!
//! 一个 POSIX sh 脚本，接收与 FFmpeg 相同的参数，按源地址中的关键字改变行为：
//! `crash` 立即退出，`stall` 忽略 SIGTERM 且不输出，`quiet` 不输出，
//! 其余情况每 100ms 刷新播放列表和切片。

use std::path::Path;
use std::time::Duration;

const SCRIPT: &str = r##"#!/bin/sh
src=""
prev=""
last=""
for arg; do
  if [ "$prev" = "-i" ]; then src="$arg"; fi
  prev="$arg"
  last="$arg"
done
dir=$(dirname "$last")
case "$src" in
  *stall*) trap '' TERM ;;
esac
printf '%s\n' "$@" > "$dir/args"
echo $$ >> "$dir/pids"
case "$src" in
  *crash*) exit 1 ;;
  *stall*) while :; do sleep 0.1; done ;;
  *quiet*) while :; do sleep 0.1; done ;;
esac
while :; do
  : > "$dir/segment_00000.ts"
  echo "#EXTM3U" > "$last"
  sleep 0.1
done
"##;

/// 在 `dir` 下写入假转码器脚本并返回其路径
#[cfg(unix)]
pub fn fake_transcoder(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ffmpeg.sh");
    std::fs::write(&path, SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// 等待文件出现，最多 5 秒
pub async fn wait_for_file(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {:?}", path);
}
