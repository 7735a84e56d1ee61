#![allow(dead_code)]

use async_trait::async_trait;
use game_supervisor::core::launcher::CommandLauncher;
use game_supervisor::domain::model::{ContentReference, FetchReport, InstallDirs, SupervisorEvent};
use game_supervisor::domain::ports::{ContentFetcher, EventSink, OccupancyCheck, ServerLauncher};
use game_supervisor::utils::error::Result;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Child;

/// 一直執行到被終止的假伺服器
pub const LONG_RUNNING: &str = "sleep 30";

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Status {
        request_id: String,
        status: String,
        message: String,
    },
    Event(SupervisorEvent),
}

/// 記錄所有送出的狀態與事件
#[derive(Debug, Default)]
pub struct RecordingSink {
    recorded: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                Recorded::Event(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self, request_id: &str) -> Vec<String> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                Recorded::Status {
                    request_id: id,
                    status,
                    ..
                } if id == request_id => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    /// 等到至少收到 `count` 個事件，逾時則回傳目前收到的
    pub async fn wait_for_events(&self, count: usize) -> Vec<SupervisorEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn status_update(&self, request_id: &str, status: &str, message: &str) {
        self.recorded.lock().unwrap().push(Recorded::Status {
            request_id: request_id.to_string(),
            status: status.to_string(),
            message: message.to_string(),
        });
    }

    async fn server_event(&self, event: SupervisorEvent) {
        self.recorded.lock().unwrap().push(Recorded::Event(event));
    }
}

/// 依序使用預先排好的 shell 腳本啟動；`None` 代表啟動失敗
pub struct ScriptedLauncher {
    queue: Mutex<VecDeque<Option<String>>>,
    fallback: Option<String>,
    spawned: Mutex<usize>,
}

impl ScriptedLauncher {
    pub fn new(scripts: Vec<Option<&str>>) -> Self {
        Self {
            queue: Mutex::new(scripts.into_iter().map(|s| s.map(str::to_string)).collect()),
            fallback: Some(LONG_RUNNING.to_string()),
            spawned: Mutex::new(0),
        }
    }

    pub fn always(script: &str) -> Self {
        Self::new(vec![]).with_fallback(Some(script))
    }

    pub fn with_fallback(mut self, fallback: Option<&str>) -> Self {
        self.fallback = fallback.map(str::to_string);
        self
    }

    pub fn spawn_count(&self) -> usize {
        *self.spawned.lock().unwrap()
    }
}

impl ServerLauncher for ScriptedLauncher {
    fn spawn(&self, name: &str, server_dir: &Path) -> Result<Child> {
        *self.spawned.lock().unwrap() += 1;
        let next = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let launcher = match next {
            Some(script) => CommandLauncher::new("sh", vec!["-c".to_string(), script]),
            None => CommandLauncher::new("/nonexistent/dedicated-server", vec![]),
        };
        launcher.spawn(name, server_dir)
    }
}

/// 回傳固定結果的內容下載器
#[derive(Default)]
pub struct StubFetcher {
    succeed: HashSet<ContentReference>,
    tool_error: Option<String>,
    calls: Mutex<Vec<Vec<ContentReference>>>,
}

impl StubFetcher {
    pub fn succeeding(references: Vec<ContentReference>) -> Self {
        Self {
            succeed: references.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn broken(message: &str) -> Self {
        Self {
            tool_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Vec<ContentReference>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentFetcher for StubFetcher {
    async fn fetch(&self, references: &[ContentReference], _targets: &InstallDirs) -> FetchReport {
        self.calls.lock().unwrap().push(references.to_vec());
        if let Some(message) = &self.tool_error {
            return FetchReport::tool_failure(message.clone());
        }
        FetchReport {
            succeeded: references
                .iter()
                .filter(|r| self.succeed.contains(*r))
                .cloned()
                .collect(),
            tool_error: None,
        }
    }
}

pub struct FixedOccupancy(pub usize);

#[async_trait]
impl OccupancyCheck for FixedOccupancy {
    async fn player_count(&self, _name: &str) -> usize {
        self.0
    }
}

pub fn install_dirs(base: &Path) -> InstallDirs {
    InstallDirs {
        playlists: base.join("missions"),
        mods: base.join("mods"),
    }
}
