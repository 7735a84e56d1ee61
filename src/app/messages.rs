use crate::domain::model::SupervisorEvent;
use crate::utils::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const START_SERVER: &str = "startServer";
pub const STOP_SERVER: &str = "stopServer";
pub const CONNECTED: &str = "connected";

pub const RESPONSE: &str = "response";
pub const STATUS_UPDATE: &str = "statusUpdate";
pub const SERVER_EVENT: &str = "serverEvent";
pub const SYNC_STATUS: &str = "syncStatus";
pub const ERROR: &str = "error";

pub const DOWNLOAD_START: &str = "workshop_download_start";
pub const DOWNLOAD_ERROR: &str = "workshop_download_error";
pub const DOWNLOAD_COMPLETE: &str = "workshop_download_complete";

/// 所有訊息共用的外框
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// 空字串的 request id 視為沒有
    pub fn new(message_type: &str, request_id: Option<String>, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            message_type: message_type.to_string(),
            request_id: request_id.filter(|id| !id.is_empty()),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartServerPayload {
    pub name: String,
    pub config: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopServerPayload {
    pub name: String,
    #[serde(default)]
    pub confirmed: bool,
}

/// 請求的回應；不適用的欄位為 `None` 且不輸出
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_port: Option<u16>,
    #[serde(rename = "failedItemIDs", default, skip_serializing_if = "Option::is_none")]
    pub failed_item_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_confirmation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<usize>,
}

impl Response {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn started(message: impl Into<String>, port: u16, failed_item_ids: Vec<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            assigned_port: Some(port),
            failed_item_ids: Some(failed_item_ids),
            ..Default::default()
        }
    }

    pub fn stopped(message: impl Into<String>, config: Option<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            config,
            ..Default::default()
        }
    }

    pub fn needs_confirmation(message: impl Into<String>, players: usize) -> Self {
        Self {
            success: false,
            message: message.into(),
            needs_confirmation: Some(true),
            players: Some(players),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running_servers: Vec<String>,
    pub max_servers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// 送往控制端的訊息
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Response {
        request_id: String,
        response: Response,
    },
    StatusUpdate {
        request_id: String,
        update: StatusUpdate,
    },
    ServerEvent(SupervisorEvent),
    SyncStatus(SyncStatus),
    Error {
        request_id: String,
        message: String,
    },
}

impl OutboundMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            OutboundMessage::Response { .. } => RESPONSE,
            OutboundMessage::StatusUpdate { .. } => STATUS_UPDATE,
            OutboundMessage::ServerEvent(_) => SERVER_EVENT,
            OutboundMessage::SyncStatus(_) => SYNC_STATUS,
            OutboundMessage::Error { .. } => ERROR,
        }
    }

    pub fn into_envelope(self) -> Result<Envelope> {
        let message_type = self.message_type();
        match self {
            OutboundMessage::Response {
                request_id,
                response,
            } => Envelope::new(message_type, Some(request_id), response),
            OutboundMessage::StatusUpdate { request_id, update } => {
                Envelope::new(message_type, Some(request_id), update)
            }
            OutboundMessage::ServerEvent(event) => Envelope::new(message_type, None, event),
            OutboundMessage::SyncStatus(status) => Envelope::new(message_type, None, status),
            OutboundMessage::Error {
                request_id,
                message,
            } => Envelope::new(message_type, Some(request_id), ErrorPayload { message }),
        }
    }
}
