#![cfg(unix)]

mod common;

use anyhow::Result;
use common::install_dirs;
use game_supervisor::domain::model::ContentReference;
use game_supervisor::domain::ports::ContentFetcher;
use game_supervisor::SteamCmdFetcher;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// 模擬 steamcmd：999 下載失敗、888 回報成功但沒有檔案、其餘建立快取目錄。
/// 結束碼非 0，以確認仍會進行複製。
const FAKE_STEAMCMD: &str = r#"#!/bin/sh
dir=$(cd "$(dirname "$0")" && pwd)
while [ $# -gt 0 ]; do
  if [ "$1" = "+workshop_download_item" ]; then
    app="$2"
    id="$3"
    shift 3
    case "$id" in
      999) echo "ERROR! Download item $id failed (Failure)." ;;
      888) echo "Success. Downloaded item $id to \"$dir/nowhere\" (0 bytes)" ;;
      *)
        base="$dir/steamapps/workshop/content/$app/$id"
        mkdir -p "$base/playlist"
        echo "<vehicle id=\"$id\"/>" > "$base/playlist/vehicle_0.xml"
        echo "mod $id" > "$base/mod.txt"
        echo "Success. Downloaded item $id to \"$base\" (42 bytes)"
        echo "Success. Downloaded item $id to \"$base\" (42 bytes)"
        ;;
    esac
  fi
  shift
done
echo "steam shutdown" >&2
exit 6
"#;

fn write_tool(dir: &Path, body: &str) -> Result<PathBuf> {
    let tool_dir = dir.join("steamcmd");
    std::fs::create_dir_all(&tool_dir)?;
    let path = tool_dir.join("steamcmd.sh");
    std::fs::write(&path, body)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[tokio::test]
async fn test_fetch_materializes_only_downloaded_items() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tool = write_tool(temp_dir.path(), FAKE_STEAMCMD)?;
    let targets = install_dirs(temp_dir.path());

    // 舊版本應被取代
    let stale = targets.mods.join("200");
    std::fs::create_dir_all(&stale)?;
    std::fs::write(stale.join("old.txt"), "old")?;

    let fetcher = SteamCmdFetcher::new(&tool, "573090");
    let requested = vec![
        ContentReference::playlist("100"),
        ContentReference::module("200"),
        ContentReference::playlist("999"),
        ContentReference::module("888"),
        ContentReference::playlist("100"),
    ];
    let report = fetcher.fetch(&requested, &targets).await;

    assert!(report.tool_error.is_none());
    assert_eq!(report.succeeded.len(), 2);
    assert!(report.is_success(&ContentReference::playlist("100")));
    assert!(report.is_success(&ContentReference::module("200")));
    assert!(!report.is_success(&ContentReference::playlist("999")));
    assert!(!report.is_success(&ContentReference::module("888")));

    // playlist 只複製 playlist 子目錄
    assert!(targets.playlists.join("100").join("vehicle_0.xml").exists());
    assert!(!targets.playlists.join("100").join("mod.txt").exists());
    // mod 複製整個項目
    assert!(targets.mods.join("200").join("mod.txt").exists());
    assert!(targets.mods.join("200").join("playlist").join("vehicle_0.xml").exists());
    assert!(!targets.mods.join("200").join("old.txt").exists());
    assert!(!targets.mods.join("888").exists());
    Ok(())
}

#[tokio::test]
async fn test_missing_tool_is_a_tool_failure() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = SteamCmdFetcher::new(temp_dir.path().join("missing").join("steamcmd.sh"), "573090");
    let report = fetcher
        .fetch(&[ContentReference::playlist("1")], &install_dirs(temp_dir.path()))
        .await;

    assert!(report.succeeded.is_empty());
    assert!(report.tool_error.is_some());
}

#[tokio::test]
async fn test_hung_tool_is_killed_after_timeout() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tool = write_tool(
        temp_dir.path(),
        "#!/bin/sh\necho \"Success. Downloaded item 1 to \\\"x\\\"\"\nexec sleep 30\n",
    )?;

    let fetcher = SteamCmdFetcher::new(&tool, "573090").with_timeout(Some(Duration::from_millis(300)));
    let started = std::time::Instant::now();
    let report = fetcher
        .fetch(&[ContentReference::module("1")], &install_dirs(temp_dir.path()))
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.succeeded.is_empty());
    assert!(report.tool_error.unwrap().contains("timed out"));
    Ok(())
}

#[tokio::test]
async fn test_empty_request_does_not_run_tool() {
    let temp_dir = TempDir::new().unwrap();
    let fetcher = SteamCmdFetcher::new("/nonexistent/steamcmd.sh", "573090");
    let report = fetcher.fetch(&[], &install_dirs(temp_dir.path())).await;
    assert!(report.succeeded.is_empty());
    assert!(report.tool_error.is_none());
}

#[tokio::test]
async fn test_non_utf8_tool_output_keeps_scanning() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tool = write_tool(
        temp_dir.path(),
        r#"#!/bin/sh
dir=$(cd "$(dirname "$0")" && pwd)
base="$dir/steamapps/workshop/content/573090/42"
mkdir -p "$base"
echo "mod 42" > "$base/mod.txt"
printf 'Loading \377\376 progress\n'
printf 'warning \377\n' >&2
echo "Success. Downloaded item 42 to \"$base\" (6 bytes)"
"#,
    )?;
    let targets = install_dirs(temp_dir.path());

    let fetcher = SteamCmdFetcher::new(&tool, "573090");
    let report = fetcher.fetch(&[ContentReference::module("42")], &targets).await;

    assert!(report.tool_error.is_none(), "{:?}", report.tool_error);
    assert!(report.is_success(&ContentReference::module("42")));
    assert!(targets.mods.join("42").join("mod.txt").exists());
    Ok(())
}
