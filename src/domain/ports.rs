use crate::domain::model::{ContentReference, FetchReport, InstallDirs, SupervisorEvent};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// 持久化的工作設定檔存放處 (`<base>/<name>/server_config.xml`)
pub trait DocumentStore: Send + Sync {
    fn server_dir(&self, name: &str) -> PathBuf;

    fn persist(
        &self,
        name: &str,
        document: &str,
    ) -> impl std::future::Future<Output = Result<PathBuf>> + Send;

    fn read(&self, name: &str) -> impl std::future::Future<Output = Result<String>> + Send;

    fn remove(&self, name: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// 啟動遊戲伺服器的 OS 行程
pub trait ServerLauncher: Send + Sync {
    fn spawn(&self, name: &str, server_dir: &Path) -> Result<tokio::process::Child>;
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, references: &[ContentReference], targets: &InstallDirs) -> FetchReport;
}

/// 傳輸層的輸出端；送出失敗只記錄，不回傳
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn status_update(&self, request_id: &str, status: &str, message: &str);
    async fn server_event(&self, event: SupervisorEvent);
}

/// 停止前的「是否仍有人連線」檢查
#[async_trait]
pub trait OccupancyCheck: Send + Sync {
    async fn player_count(&self, name: &str) -> usize;
}

/// 沒有玩家資訊來源時的預設實作
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOccupancy;

#[async_trait]
impl OccupancyCheck for NoOccupancy {
    async fn player_count(&self, _name: &str) -> usize {
        0
    }
}
