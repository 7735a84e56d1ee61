use crate::domain::ports::ServerLauncher;
use crate::utils::error::{Result, SupervisorError};
use crate::utils::lines::RawLines;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// 以 `<program> <args...> +server_dir <abs dir>` 啟動遊戲伺服器
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl ServerLauncher for CommandLauncher {
    fn spawn(&self, name: &str, server_dir: &Path) -> Result<Child> {
        let server_dir = std::path::absolute(server_dir).map_err(|source| SupervisorError::Spawn {
            name: name.to_string(),
            source,
        })?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("+server_dir")
            .arg(&server_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // 工作目錄為執行檔所在目錄
        if let Some(parent) = self
            .program
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            command.current_dir(parent);
        }

        tracing::info!(
            server = name,
            "Launching {} {:?} +server_dir {}",
            self.program.display(),
            self.args,
            server_dir.display()
        );

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            name: name.to_string(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(name.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.to_string(), "stderr", stderr);
        }

        Ok(child)
    }
}

/// 將子行程輸出逐行轉送到 tracing，直到 EOF 都持續讀取。
///
/// 提早放掉讀取端會讓伺服器下一次寫入收到 SIGPIPE。
fn forward_output<R>(name: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = RawLines::new(BufReader::new(reader));
        loop {
            match lines.next_lossy().await {
                Ok(Some(line)) => tracing::info!(server = %name, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %name, stream, "Output stream closed: {}", e);
                    break;
                }
            }
        }
    });
}
