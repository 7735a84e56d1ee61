use crate::app::messages::{
    Response, SyncStatus, DOWNLOAD_COMPLETE, DOWNLOAD_ERROR, DOWNLOAD_START,
};
use crate::core::config_transform::{
    extract_references, reinsert_references, rewrite_port, ReferencePaths,
};
use crate::core::port_allocator::PortAllocator;
use crate::core::registry::ProcessRegistry;
use crate::domain::model::InstallDirs;
use crate::domain::ports::{ContentFetcher, DocumentStore, EventSink, NoOccupancy, OccupancyCheck};
use crate::utils::error::{Result, SupervisorError};
use crate::utils::validation::validate_server_name;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

type NameLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// 持有某個名稱的鎖；釋放時若沒有其他人在等，就把項目從表中移除
struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

/// 最終要寫入的設定檔與下載失敗的 ID
struct PreparedDocument {
    document: String,
    failed_ids: Vec<String>,
}

/// 串接啟動/停止流程，並在中途失敗時回收連接埠與目錄。
///
/// 同名稱的請求以每個名稱一把非同步鎖依序處理；不同名稱互不阻擋。
pub struct Orchestrator<S: DocumentStore> {
    ports: Arc<PortAllocator>,
    registry: ProcessRegistry,
    fetcher: Arc<dyn ContentFetcher>,
    occupancy: Arc<dyn OccupancyCheck>,
    events: Arc<dyn EventSink>,
    store: S,
    install_dirs: InstallDirs,
    reference_paths: ReferencePaths,
    name_locks: NameLocks,
}

impl<S: DocumentStore> Orchestrator<S> {
    pub fn new(
        registry: ProcessRegistry,
        fetcher: Arc<dyn ContentFetcher>,
        events: Arc<dyn EventSink>,
        store: S,
        install_dirs: InstallDirs,
    ) -> Self {
        Self {
            ports: registry.ports().clone(),
            registry,
            fetcher,
            occupancy: Arc::new(NoOccupancy),
            events,
            store,
            install_dirs,
            reference_paths: ReferencePaths::default(),
            name_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_occupancy(mut self, occupancy: Arc<dyn OccupancyCheck>) -> Self {
        self.occupancy = occupancy;
        self
    }

    pub fn with_reference_paths(mut self, reference_paths: ReferencePaths) -> Self {
        self.reference_paths = reference_paths;
        self
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sync_status(&self) -> SyncStatus {
        SyncStatus {
            running_servers: self.registry.names(),
            max_servers: self.ports.range().len(),
        }
    }

    /// 目前被持有或等待中的名稱鎖數量
    pub fn active_name_locks(&self) -> usize {
        self.name_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn lock_name(&self, name: &str) -> NameGuard<'_> {
        let lock = self
            .name_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone();
        NameGuard {
            locks: &self.name_locks,
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    pub async fn start_server(&self, request_id: &str, name: &str, config: &str) -> Response {
        tracing::info!(request_id, server = name, "🚀 Start requested");
        match self.try_start(request_id, name, config).await {
            Ok(response) => {
                tracing::info!(request_id, server = name, "✅ {}", response.message);
                response
            }
            Err(e) => {
                if e.is_request_fatal() {
                    tracing::error!(request_id, server = name, "❌ Start failed: {}", e);
                } else {
                    tracing::warn!(request_id, server = name, "Start failed: {}", e);
                }
                Response::failure(format!("Failed to start server '{}': {}", name, e))
            }
        }
    }

    async fn try_start(&self, request_id: &str, name: &str, config: &str) -> Result<Response> {
        validate_server_name(name)?;
        let _guard = self.lock_name(name).await;

        let port = self.claim_port(name).await?;
        tracing::info!(request_id, server = name, port, "Port claimed");

        let prepared = match self.prepare_document(request_id, config, port).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        if let Err(e) = self.store.persist(name, &prepared.document).await {
            self.ports.release(port);
            return Err(e);
        }

        self.stop_existing(name).await;

        let server_dir = self.store.server_dir(name);
        let info = match self.registry.launch(name, &server_dir, port) {
            Ok(info) => info,
            Err(e) => {
                self.ports.release(port);
                if let Err(remove_err) = self.store.remove(name).await {
                    tracing::warn!(request_id, server = name, "Cleanup after failed launch: {}", remove_err);
                }
                return Err(e);
            }
        };

        let mut message = format!("Server '{}' started (pid {})", name, info.pid);
        if !prepared.failed_ids.is_empty() {
            message.push_str(&format!(
                "; {} workshop item(s) failed to download",
                prepared.failed_ids.len()
            ));
        }
        Ok(Response::started(message, port, prepared.failed_ids))
    }

    /// 範圍已滿且同名伺服器正在執行時，先停掉它再取一次
    async fn claim_port(&self, name: &str) -> Result<u16> {
        match self.ports.claim() {
            Err(SupervisorError::PortExhausted { .. }) if self.registry.contains(name) => {
                tracing::info!(server = name, "Port range exhausted, replacing the running instance first");
                self.stop_existing(name).await;
                self.ports.claim()
            }
            other => other,
        }
    }

    async fn prepare_document(&self, request_id: &str, config: &str, port: u16) -> Result<PreparedDocument> {
        let with_port = rewrite_port(config, port)?;
        let extraction = extract_references(&with_port)?;
        tracing::info!(
            request_id,
            playlists = extraction.playlist_ids().len(),
            mods = extraction.mod_ids().len(),
            "Content references extracted"
        );

        if extraction.references.is_empty() {
            return Ok(PreparedDocument {
                document: extraction.document,
                failed_ids: Vec::new(),
            });
        }

        self.events
            .status_update(
                request_id,
                DOWNLOAD_START,
                "Downloading/updating workshop items...",
            )
            .await;

        let report = self
            .fetcher
            .fetch(&extraction.references, &self.install_dirs)
            .await;
        if let Some(tool_error) = &report.tool_error {
            self.events
                .status_update(
                    request_id,
                    DOWNLOAD_ERROR,
                    &format!("Content tool failed: {}", tool_error),
                )
                .await;
        }

        let reinsertion = reinsert_references(
            &extraction.document,
            &extraction.references,
            &report.succeeded,
            &self.reference_paths,
        )?;

        let requested = extraction.references.len();
        let succeeded = extraction
            .references
            .iter()
            .filter(|r| report.is_success(r))
            .count();
        let mut summary = format!("Workshop items processed ({}/{} succeeded)", succeeded, requested);
        if !reinsertion.failed_ids.is_empty() {
            summary.push_str(&format!(
                ", failed: {}",
                reinsertion.failed_ids.join(", ")
            ));
        }
        tracing::info!(request_id, "{}", summary);
        self.events
            .status_update(request_id, DOWNLOAD_COMPLETE, &summary)
            .await;

        Ok(PreparedDocument {
            document: reinsertion.document,
            failed_ids: reinsertion.failed_ids,
        })
    }

    /// 停掉同名的舊行程並釋放它的連接埠
    async fn stop_existing(&self, name: &str) {
        match self.registry.stop(name).await {
            Ok(stopped) => {
                tracing::info!(server = name, pid = stopped.pid, port = stopped.port, "Previous instance stopped");
                self.ports.release(stopped.port);
            }
            Err(SupervisorError::NotRunning { .. }) => {}
            Err(e) => tracing::warn!(server = name, "Stopping previous instance failed: {}", e),
        }
    }

    pub async fn stop_server(&self, request_id: &str, name: &str, confirmed: bool) -> Response {
        tracing::info!(request_id, server = name, confirmed, "🛑 Stop requested");
        if let Err(e) = validate_server_name(name) {
            return Response::failure(e.to_string());
        }
        let _guard = self.lock_name(name).await;

        if !confirmed {
            let players = self.occupancy.player_count(name).await;
            if players > 0 {
                tracing::info!(request_id, server = name, players, "Stop needs confirmation");
                return Response::needs_confirmation(
                    format!("{} player(s) are still connected to '{}'", players, name),
                    players,
                );
            }
        }

        let stopped = match self.registry.stop(name).await {
            Ok(stopped) => stopped,
            Err(e) => {
                tracing::info!(request_id, server = name, "Nothing to stop: {}", e);
                return Response::failure(format!("Server '{}' is not running", name));
            }
        };
        self.ports.release(stopped.port);

        let response = match self.store.read(name).await {
            Ok(document) => Response::stopped(
                format!("Server '{}' stopped and its configuration was read back", name),
                Some(document),
            ),
            Err(e) => {
                tracing::error!(request_id, server = name, "Reading persisted configuration failed: {}", e);
                Response::stopped(
                    format!("Server '{}' stopped, but reading its configuration failed: {}", name, e),
                    None,
                )
            }
        };

        if let Err(e) = self.store.remove(name).await {
            tracing::error!(request_id, server = name, "Removing server directory failed: {}", e);
        }

        tracing::info!(request_id, server = name, port = stopped.port, "✅ Server stopped");
        response
    }

    /// 結束時停止所有受管行程
    pub async fn shutdown(&self) {
        let stopped = self.registry.stop_all().await;
        tracing::info!("Stopped {} server process(es)", stopped.len());
    }
}
