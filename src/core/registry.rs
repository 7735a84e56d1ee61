use crate::core::port_allocator::PortAllocator;
use crate::domain::model::{ExitReport, ProcessInfo, ProcessState, SupervisorEvent};
use crate::domain::ports::{EventSink, ServerLauncher};
use crate::utils::error::{Result, SupervisorError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::Child;
use tokio::sync::{watch, Notify};

/// 停止後回傳給呼叫端的資訊；連接埠由呼叫端釋放
#[derive(Debug, Clone)]
pub struct StoppedProcess {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub exit: Option<ExitReport>,
}

/// 對單一 OS 行程實例的控制端
#[derive(Debug, Clone)]
struct ProcessControl {
    kill: Arc<Notify>,
    exited: watch::Receiver<Option<ExitReport>>,
}

#[derive(Debug)]
struct ProcessRecord {
    pid: u32,
    port: u16,
    instance: u64,
    state: ProcessState,
    server_dir: PathBuf,
    started_at: DateTime<Utc>,
    control: ProcessControl,
}

impl ProcessRecord {
    fn info(&self, name: &str) -> ProcessInfo {
        ProcessInfo {
            name: name.to_string(),
            pid: self.pid,
            port: self.port,
            state: self.state,
            started_at: self.started_at,
        }
    }
}

/// 監控任務持有的一端
struct WatchHandles {
    instance: u64,
    kill: Arc<Notify>,
    exit_tx: watch::Sender<Option<ExitReport>>,
}

impl WatchHandles {
    fn new(instance: u64) -> (Self, ProcessControl) {
        let kill = Arc::new(Notify::new());
        let (exit_tx, exited) = watch::channel(None);
        let control = ProcessControl {
            kill: kill.clone(),
            exited,
        };
        (
            Self {
                instance,
                kill,
                exit_tx,
            },
            control,
        )
    }
}

struct RegistryInner {
    records: Mutex<HashMap<String, ProcessRecord>>,
    ports: Arc<PortAllocator>,
    launcher: Arc<dyn ServerLauncher>,
    events: Arc<dyn EventSink>,
    next_instance: AtomicU64,
}

/// 名稱 -> 執行中行程 的登錄表，並為每個行程維持一個監控任務。
///
/// 鎖只在檢查/插入/移除時持有，等待行程結束一律在鎖外進行。
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    pub fn new(
        ports: Arc<PortAllocator>,
        launcher: Arc<dyn ServerLauncher>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                records: Mutex::new(HashMap::new()),
                ports,
                launcher,
                events,
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.inner.ports
    }

    /// 啟動行程、登錄並開始監控
    pub fn launch(&self, name: &str, server_dir: &Path, port: u16) -> Result<ProcessInfo> {
        if self.inner.lock_records().contains_key(name) {
            return Err(SupervisorError::AlreadyRunning {
                name: name.to_string(),
            });
        }

        let mut child = self.inner.launcher.spawn(name, server_dir)?;
        let pid = child.id().unwrap_or_default();
        let (handles, control) = WatchHandles::new(self.inner.next_instance());

        let record = ProcessRecord {
            pid,
            port,
            instance: handles.instance,
            state: ProcessState::Running,
            server_dir: server_dir.to_path_buf(),
            started_at: Utc::now(),
            control,
        };
        let info = record.info(name);

        {
            let mut records = self.inner.lock_records();
            if records.contains_key(name) {
                drop(records);
                tracing::warn!(server = name, pid, "Name was registered concurrently, discarding new process");
                discard_child(child);
                return Err(SupervisorError::AlreadyRunning {
                    name: name.to_string(),
                });
            }
            records.insert(name.to_string(), record);
        }

        tracing::info!(server = name, pid, port, "Server process registered");
        tokio::spawn(supervise(self.inner.clone(), name.to_string(), child, handles));

        Ok(info)
    }

    /// 先移除登錄 (讓監控任務知道是主動停止)，再強制終止並等待結束
    pub async fn stop(&self, name: &str) -> Result<StoppedProcess> {
        let record = self
            .inner
            .lock_records()
            .remove(name)
            .ok_or_else(|| SupervisorError::NotRunning {
                name: name.to_string(),
            })?;

        tracing::info!(
            server = name,
            pid = record.pid,
            port = record.port,
            state = ?record.state,
            "Stopping server process"
        );

        record.control.kill.notify_one();
        let mut exited = record.control.exited.clone();
        let exit = match exited.wait_for(|report| report.is_some()).await {
            Ok(report) => report.clone(),
            Err(_) => {
                tracing::warn!(server = name, "Watch task ended without reporting an exit status");
                None
            }
        };

        tracing::info!(server = name, pid = record.pid, "Server process stopped");
        Ok(StoppedProcess {
            name: name.to_string(),
            pid: record.pid,
            port: record.port,
            exit,
        })
    }

    /// 停止所有行程並釋放其連接埠
    pub async fn stop_all(&self) -> Vec<StoppedProcess> {
        let mut stopped = Vec::new();
        for name in self.names() {
            if let Ok(process) = self.stop(&name).await {
                self.inner.ports.release(process.port);
                stopped.push(process);
            }
        }
        stopped
    }

    pub fn get(&self, name: &str) -> Option<ProcessInfo> {
        self.inner
            .lock_records()
            .get(name)
            .map(|record| record.info(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock_records().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock_records().keys().cloned().collect();
        names.sort();
        names
    }
}

impl RegistryInner {
    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, ProcessRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_instance(&self) -> u64 {
        self.next_instance.fetch_add(1, Ordering::Relaxed)
    }

    /// 登錄仍指向同一實例時視為崩潰，標記為重啟中並回傳重啟所需資訊
    fn mark_crashed(&self, name: &str, instance: u64) -> Option<(u16, PathBuf)> {
        let mut records = self.lock_records();
        match records.get_mut(name) {
            Some(record) if record.instance == instance => {
                record.state = ProcessState::Restarting;
                Some((record.port, record.server_dir.clone()))
            }
            Some(record) => {
                tracing::debug!(
                    server = name,
                    instance,
                    current = record.instance,
                    "Exit belongs to a superseded instance"
                );
                None
            }
            None => None,
        }
    }

    /// 原地替換為重啟後的新行程 (同名稱、同連接埠)
    fn install_restarted(
        &self,
        name: &str,
        old_instance: u64,
        pid: u32,
        instance: u64,
        control: ProcessControl,
    ) -> bool {
        let mut records = self.lock_records();
        match records.get_mut(name) {
            Some(record) if record.instance == old_instance => {
                record.pid = pid;
                record.instance = instance;
                record.state = ProcessState::Running;
                record.started_at = Utc::now();
                record.control = control;
                true
            }
            _ => false,
        }
    }

    fn remove_instance(&self, name: &str, instance: u64) -> Option<ProcessRecord> {
        let mut records = self.lock_records();
        match records.get(name) {
            Some(record) if record.instance == instance => records.remove(name),
            _ => None,
        }
    }

    async fn emit(&self, event: SupervisorEvent) {
        tracing::info!(server = event.server_name(), "Emitting {}", event.label());
        self.events.server_event(event).await;
    }
}

/// 每個名稱一個長壽命任務：等待結束、判斷是否崩潰、最多重啟一次，
/// 重啟成功後在同一個迴圈中繼續監控新行程。
async fn supervise(
    inner: Arc<RegistryInner>,
    name: String,
    mut child: Child,
    mut handles: WatchHandles,
) {
    loop {
        let pid = child.id().unwrap_or_default();
        tracing::debug!(server = %name, pid, "Watching server process");

        let report = tokio::select! {
            status = child.wait() => exit_report(status),
            _ = handles.kill.notified() => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(server = %name, pid, "Kill failed: {}", e);
                }
                exit_report(child.wait().await)
            }
        };
        tracing::info!(server = %name, pid, "Server process exited: {}", report.description);
        handles.exit_tx.send_replace(Some(report.clone()));

        let Some((port, server_dir)) = inner.mark_crashed(&name, handles.instance) else {
            tracing::debug!(server = %name, pid, "Exit was expected, watch finished");
            break;
        };

        tracing::warn!(server = %name, pid, port, "💥 Crash detected, attempting restart");
        inner
            .emit(SupervisorEvent::CrashDetected {
                server_name: name.clone(),
                pid,
                error: report.error_message(),
            })
            .await;

        match inner.launcher.spawn(&name, &server_dir) {
            Ok(new_child) => {
                let new_pid = new_child.id().unwrap_or_default();
                let (new_handles, control) = WatchHandles::new(inner.next_instance());

                if inner.install_restarted(&name, handles.instance, new_pid, new_handles.instance, control) {
                    let message = format!("Server '{}' restarted (new pid {})", name, new_pid);
                    tracing::info!(server = %name, pid = new_pid, port, "{}", message);
                    inner
                        .emit(SupervisorEvent::RestartResult {
                            server_name: name.clone(),
                            success: true,
                            message,
                        })
                        .await;
                    child = new_child;
                    handles = new_handles;
                    continue;
                }

                // 重啟期間被停止；新行程不得留下
                discard_child(new_child);
                let message = format!("Server '{}' was stopped while restarting", name);
                tracing::info!(server = %name, "{}", message);
                inner
                    .emit(SupervisorEvent::RestartResult {
                        server_name: name.clone(),
                        success: false,
                        message,
                    })
                    .await;
                break;
            }
            Err(e) => {
                if inner.remove_instance(&name, handles.instance).is_some() {
                    inner.ports.release(port);
                }
                let message = format!("Failed to restart server '{}': {}", name, e);
                tracing::error!(server = %name, port, "{}", message);
                inner
                    .emit(SupervisorEvent::RestartResult {
                        server_name: name.clone(),
                        success: false,
                        message,
                    })
                    .await;
                break;
            }
        }
    }
}

fn exit_report(status: std::io::Result<std::process::ExitStatus>) -> ExitReport {
    match status {
        Ok(status) => ExitReport::from_status(status),
        Err(e) => ExitReport::from_wait_error(&e),
    }
}

fn discard_child(mut child: Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Kill of discarded process failed: {}", e);
    }
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}
