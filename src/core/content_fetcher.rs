use crate::domain::model::{ContentKind, ContentReference, FetchReport, InstallDirs};
use crate::domain::ports::ContentFetcher;
use crate::utils::error::{Result, SupervisorError};
use crate::utils::lines::RawLines;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

static SUCCESS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Success\. Downloaded item ([0-9]+)").expect("success marker pattern is valid")
});

/// 從工具輸出的一行中找出下載完成的 ID
pub fn parse_success_marker(line: &str) -> Option<&str> {
    SUCCESS_MARKER
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// 工具執行結束後的原始結果
struct ToolOutcome {
    downloaded: Vec<String>,
    status: std::io::Result<ExitStatus>,
}

/// 透過 SteamCMD 批次下載工作坊內容，再複製到安裝目錄
#[derive(Debug, Clone)]
pub struct SteamCmdFetcher {
    tool_path: PathBuf,
    app_id: String,
    timeout: Option<Duration>,
}

impl SteamCmdFetcher {
    pub fn new(tool_path: impl Into<PathBuf>, app_id: impl Into<String>) -> Self {
        Self {
            tool_path: tool_path.into(),
            app_id: app_id.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// `<工具目錄>/steamapps/workshop/content/<appId>`
    pub fn content_root(&self) -> PathBuf {
        self.tool_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join("steamapps")
            .join("workshop")
            .join("content")
            .join(&self.app_id)
    }

    pub fn source_path(&self, reference: &ContentReference) -> PathBuf {
        let item_dir = self.content_root().join(&reference.id);
        match reference.kind {
            ContentKind::Playlist => item_dir.join("playlist"),
            ContentKind::Mod => item_dir,
        }
    }

    pub fn target_path(reference: &ContentReference, targets: &InstallDirs) -> PathBuf {
        targets.for_kind(reference.kind).join(&reference.id)
    }

    fn build_args(&self, references: &[ContentReference]) -> Vec<String> {
        let mut args = vec!["+login".to_string(), "anonymous".to_string()];
        let mut seen = HashSet::new();
        for reference in references {
            if seen.insert(reference.id.as_str()) {
                args.extend([
                    "+workshop_download_item".to_string(),
                    self.app_id.clone(),
                    reference.id.clone(),
                    "validate".to_string(),
                ]);
            }
        }
        args.push("+quit".to_string());
        args
    }

    /// 單次呼叫工具涵蓋所有 ID，回傳遠端下載成功的 ID
    async fn run_tool(&self, references: &[ContentReference]) -> Result<ToolOutcome> {
        let args = self.build_args(references);
        tracing::info!("Running {} {}", self.tool_path.display(), args.join(" "));

        let mut child = Command::new(&self.tool_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::FetchTool {
                message: format!("failed to start {}: {}", self.tool_path.display(), e),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, collect_output(&mut child, stdout, stderr)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::error!("Content tool did not finish within {:?}, killing it", limit);
                        if let Err(e) = child.kill().await {
                            tracing::warn!("Failed to kill content tool: {}", e);
                        }
                        Err(SupervisorError::FetchTool {
                            message: format!("content tool timed out after {:?}", limit),
                        })
                    }
                }
            }
            None => collect_output(&mut child, stdout, stderr).await,
        }
    }
}

async fn collect_output(
    child: &mut Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> Result<ToolOutcome> {
    let (downloaded, stderr_result) = tokio::join!(scan_progress(stdout), drain_stderr(stderr));
    let status = child.wait().await;

    let downloaded = downloaded.map_err(|e| SupervisorError::FetchTool {
        message: format!("failed to read content tool output: {}", e),
    })?;
    if let Err(e) = stderr_result {
        tracing::warn!("Failed to read content tool stderr: {}", e);
    }

    Ok(ToolOutcome { downloaded, status })
}

/// 逐行比對成功訊息；同一 ID 只記錄第一次。非 UTF-8 的輸出照樣掃描
async fn scan_progress(stdout: Option<ChildStdout>) -> std::io::Result<Vec<String>> {
    let mut downloaded: Vec<String> = Vec::new();
    let Some(stdout) = stdout else {
        return Ok(downloaded);
    };

    let mut lines = RawLines::new(BufReader::new(stdout));
    while let Some(line) = lines.next_lossy().await? {
        tracing::debug!(tool = "steamcmd", "{}", line);
        if let Some(id) = parse_success_marker(&line) {
            if !downloaded.iter().any(|known| known == id) {
                tracing::info!(id, "Content item downloaded");
                downloaded.push(id.to_string());
            }
        }
    }
    Ok(downloaded)
}

async fn drain_stderr(stderr: Option<ChildStderr>) -> std::io::Result<()> {
    let Some(stderr) = stderr else {
        return Ok(());
    };

    let mut lines = RawLines::new(BufReader::new(stderr));
    while let Some(line) = lines.next_lossy().await? {
        tracing::warn!(tool = "steamcmd", "{}", line);
    }
    Ok(())
}

#[async_trait]
impl ContentFetcher for SteamCmdFetcher {
    async fn fetch(&self, references: &[ContentReference], targets: &InstallDirs) -> FetchReport {
        let mut seen = HashSet::new();
        let unique: Vec<ContentReference> = references
            .iter()
            .filter(|r| seen.insert(*r))
            .cloned()
            .collect();
        if unique.is_empty() {
            return FetchReport::default();
        }

        let outcome = match self.run_tool(&unique).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Content fetch aborted: {}", e);
                return FetchReport::tool_failure(e.to_string());
            }
        };

        match &outcome.status {
            Ok(status) if status.success() => tracing::info!("Content tool finished"),
            Ok(status) => tracing::warn!("Content tool exited with {}, materializing anyway", status),
            Err(e) => tracing::warn!("Waiting for content tool failed: {}, materializing anyway", e),
        }

        let content_root = self.content_root();
        if !content_root.exists() {
            tracing::warn!(
                "Content cache {} does not exist, downloads probably failed",
                content_root.display()
            );
        }

        let mut report = FetchReport::default();
        for reference in unique
            .iter()
            .filter(|r| outcome.downloaded.contains(&r.id))
        {
            let source = self.source_path(reference);
            let target = Self::target_path(reference, targets);
            tracing::info!(
                kind = %reference.kind,
                id = %reference.id,
                "Materializing {} -> {}",
                source.display(),
                target.display()
            );

            let result = {
                let (source, target) = (source.clone(), target.clone());
                tokio::task::spawn_blocking(move || materialize(&source, &target)).await
            };
            match result {
                Ok(Ok(())) => {
                    report.succeeded.insert(reference.clone());
                }
                Ok(Err(e)) => {
                    tracing::error!(kind = %reference.kind, id = %reference.id, "Materialization failed: {}", e);
                }
                Err(e) => {
                    tracing::error!(kind = %reference.kind, id = %reference.id, "Materialization task failed: {}", e);
                }
            }
        }

        tracing::info!(
            "Content fetch finished: {}/{} succeeded",
            report.succeeded.len(),
            unique.len()
        );
        report
    }
}

/// 以來源目錄取代目標目錄；目標不存在不是錯誤
pub fn materialize(source: &Path, target: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(source).map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("source {} is not available: {}", source.display(), e),
        )
    })?;
    if !metadata.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("source {} is not a directory", source.display()),
        ));
    }

    match std::fs::remove_dir_all(target) {
        Ok(()) => tracing::debug!("Removed previous {}", target.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(std::io::Error::new(
                e.kind(),
                format!("failed to remove {}: {}", target.display(), e),
            ))
        }
    }

    copy_dir(source, target)
}

pub fn copy_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("failed to copy {} to {}: {}", from.display(), to.display(), e),
                )
            })?;
        }
    }
    Ok(())
}
