use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;

/// 可分配的連接埠範圍 (包含兩端)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }

    pub fn len(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            (self.max - self.min) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Playlist,
    Mod,
}

impl ContentKind {
    pub fn from_container_name(name: &[u8]) -> Option<Self> {
        match name {
            b"playlists" => Some(ContentKind::Playlist),
            b"mods" => Some(ContentKind::Mod),
            _ => None,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Playlist => write!(f, "playlist"),
            ContentKind::Mod => write!(f, "mod"),
        }
    }
}

/// 從設定檔抽出的內容引用，只存活於一次啟動流程
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentReference {
    pub id: String,
    pub kind: ContentKind,
}

impl ContentReference {
    pub fn new(id: impl Into<String>, kind: ContentKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn playlist(id: impl Into<String>) -> Self {
        Self::new(id, ContentKind::Playlist)
    }

    pub fn module(id: impl Into<String>) -> Self {
        Self::new(id, ContentKind::Mod)
    }
}

/// 內容安裝目錄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallDirs {
    pub playlists: std::path::PathBuf,
    pub mods: std::path::PathBuf,
}

impl InstallDirs {
    pub fn for_kind(&self, kind: ContentKind) -> &std::path::Path {
        match kind {
            ContentKind::Playlist => &self.playlists,
            ContentKind::Mod => &self.mods,
        }
    }
}

/// 一次批次下載的結果：成功集合為「遠端下載成功」與「落地複製成功」的交集
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub succeeded: std::collections::HashSet<ContentReference>,
    pub tool_error: Option<String>,
}

impl FetchReport {
    pub fn tool_failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: Default::default(),
            tool_error: Some(message.into()),
        }
    }

    pub fn is_success(&self, reference: &ContentReference) -> bool {
        self.succeeded.contains(reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// 登錄中的行程狀態；停止或重啟失敗的行程不會留在登錄表
pub enum ProcessState {
    Running,
    Restarting,
}

/// 已註冊的伺服器行程快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
}

/// 行程結束狀態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub success: bool,
    pub description: String,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
            description: status.to_string(),
        }
    }

    pub fn from_wait_error(err: &std::io::Error) -> Self {
        Self {
            code: None,
            success: false,
            description: format!("wait failed: {}", err),
        }
    }

    /// 崩潰事件的錯誤訊息，正常結束時為空字串
    pub fn error_message(&self) -> String {
        if self.success {
            String::new()
        } else {
            self.description.clone()
        }
    }
}

/// 監控任務發出的非同步事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum SupervisorEvent {
    #[serde(rename = "serverCrashDetected")]
    CrashDetected {
        #[serde(rename = "serverName")]
        server_name: String,
        pid: u32,
        error: String,
    },
    #[serde(rename = "serverRestartResult")]
    RestartResult {
        #[serde(rename = "serverName")]
        server_name: String,
        success: bool,
        message: String,
    },
}

impl SupervisorEvent {
    pub fn server_name(&self) -> &str {
        match self {
            SupervisorEvent::CrashDetected { server_name, .. } => server_name,
            SupervisorEvent::RestartResult { server_name, .. } => server_name,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SupervisorEvent::CrashDetected { .. } => "serverCrashDetected",
            SupervisorEvent::RestartResult { .. } => "serverRestartResult",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range() {
        let range = PortRange::new(9000, 9002);
        assert_eq!(range.len(), 3);
        assert!(range.contains(9000));
        assert!(range.contains(9002));
        assert!(!range.contains(8999));
        assert!(!range.contains(9003));
        assert!(PortRange::new(10, 9).is_empty());
    }

    #[test]
    fn test_container_names() {
        assert_eq!(
            ContentKind::from_container_name(b"playlists"),
            Some(ContentKind::Playlist)
        );
        assert_eq!(ContentKind::from_container_name(b"mods"), Some(ContentKind::Mod));
        assert_eq!(ContentKind::from_container_name(b"path"), None);
    }

    #[test]
    fn test_event_wire_format() {
        let event = SupervisorEvent::CrashDetected {
            server_name: "alpha".to_string(),
            pid: 42,
            error: "exit status: 1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "serverCrashDetected");
        assert_eq!(json["serverName"], "alpha");
        assert_eq!(json["pid"], 42);

        let event = SupervisorEvent::RestartResult {
            server_name: "alpha".to_string(),
            success: false,
            message: "spawn failed".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "serverRestartResult");
        assert_eq!(json["success"], false);
    }
}
