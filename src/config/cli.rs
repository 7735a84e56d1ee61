use crate::domain::ports::DocumentStore;
use crate::utils::error::{Result, SupervisorError};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "server_config.xml";

#[cfg(feature = "cli")]
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "game-supervisor")]
#[command(about = "Supervises dedicated game server processes driven by JSON-line commands on stdin")]
pub struct CliArgs {
    /// TOML 設定檔；未指定時從環境變數 (含 .env) 讀取
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON lines on stderr")]
    pub json_logs: bool,
}

/// 每個伺服器一個目錄：`<base>/<name>/server_config.xml`
#[derive(Debug, Clone)]
pub struct LocalConfigStore {
    base_path: PathBuf,
}

impl LocalConfigStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.server_dir(name).join(CONFIG_FILE_NAME)
    }
}

impl DocumentStore for LocalConfigStore {
    fn server_dir(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    async fn persist(&self, name: &str, document: &str) -> Result<PathBuf> {
        let dir = self.server_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SupervisorError::Persistence {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, document)
            .await
            .map_err(|source| SupervisorError::Persistence {
                path: path.clone(),
                source,
            })?;

        tracing::info!(server = name, "Saved {}", path.display());
        Ok(path)
    }

    async fn read(&self, name: &str) -> Result<String> {
        let path = self.config_path(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SupervisorError::Persistence { path, source })
    }

    /// 目錄不存在不是錯誤
    async fn remove(&self, name: &str) -> Result<()> {
        let dir = self.server_dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(server = name, "Removed {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SupervisorError::Persistence { path: dir, source }),
        }
    }
}
