use crate::app::messages::{
    Envelope, OutboundMessage, StartServerPayload, StopServerPayload, CONNECTED, START_SERVER,
    STOP_SERVER,
};
use crate::app::stdio::Outbound;
use crate::core::orchestrator::Orchestrator;
use crate::domain::ports::DocumentStore;
use crate::utils::error::Result;
use crate::utils::lines::RawLines;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio::task::JoinSet;

/// 讀取請求並把每個請求交給獨立任務處理，接收迴圈本身不等待
pub struct Dispatcher<S: DocumentStore + 'static> {
    orchestrator: Arc<Orchestrator<S>>,
    outbound: Outbound,
}

impl<S: DocumentStore + 'static> Dispatcher<S> {
    pub fn new(orchestrator: Arc<Orchestrator<S>>, outbound: Outbound) -> Self {
        Self {
            orchestrator,
            outbound,
        }
    }

    /// 先送出 syncStatus，再處理輸入直到 EOF，最後等待進行中的請求
    pub async fn run<R>(&self, reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let status = self.orchestrator.sync_status();
        tracing::info!(
            running = status.running_servers.len(),
            max = status.max_servers,
            "Sending syncStatus"
        );
        self.outbound.send(OutboundMessage::SyncStatus(status));

        let mut tasks = JoinSet::new();
        let mut lines = RawLines::new(reader);
        while let Some(raw) = lines.next_raw().await? {
            // 無法解碼的行視同格式錯誤，沒有可回覆的 request id
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Malformed message: not valid UTF-8 ({})", e);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            self.dispatch(line, &mut tasks);
            // 回收已完成的任務
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Request task failed: {}", e);
                }
            }
        }

        tracing::info!("Input closed, waiting for {} in-flight request(s)", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Request task failed: {}", e);
            }
        }
        Ok(())
    }

    pub fn dispatch(&self, line: &str, tasks: &mut JoinSet<()>) {
        let envelope = match Envelope::parse(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Malformed message: {}", e);
                if let Some(request_id) = salvage_request_id(line) {
                    self.send_error(request_id, format!("malformed message: {}", e));
                }
                return;
            }
        };
        let request_id = envelope.request_id.clone().unwrap_or_default();

        match envelope.message_type.as_str() {
            START_SERVER => {
                let payload: StartServerPayload = match envelope.payload_as() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(request_id = %request_id, "Invalid startServer payload: {}", e);
                        self.send_error(request_id, format!("invalid startServer payload: {}", e));
                        return;
                    }
                };
                let orchestrator = self.orchestrator.clone();
                let outbound = self.outbound.clone();
                tasks.spawn(async move {
                    let response = orchestrator
                        .start_server(&request_id, &payload.name, &payload.config)
                        .await;
                    outbound.send(OutboundMessage::Response {
                        request_id,
                        response,
                    });
                });
            }
            STOP_SERVER => {
                let payload: StopServerPayload = match envelope.payload_as() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(request_id = %request_id, "Invalid stopServer payload: {}", e);
                        self.send_error(request_id, format!("invalid stopServer payload: {}", e));
                        return;
                    }
                };
                let orchestrator = self.orchestrator.clone();
                let outbound = self.outbound.clone();
                tasks.spawn(async move {
                    let response = orchestrator
                        .stop_server(&request_id, &payload.name, payload.confirmed)
                        .await;
                    outbound.send(OutboundMessage::Response {
                        request_id,
                        response,
                    });
                });
            }
            CONNECTED => {
                tracing::info!("Controller acknowledged connection: {}", envelope.payload);
            }
            other => {
                tracing::warn!(request_id = %request_id, "Unsupported message type: {}", other);
                self.send_error(request_id, format!("unsupported message type: {}", other));
            }
        }
    }

    /// 沒有 request id 的錯誤無處回覆，只記錄
    fn send_error(&self, request_id: String, message: String) {
        if request_id.is_empty() {
            return;
        }
        self.outbound.send(OutboundMessage::Error {
            request_id,
            message,
        });
    }
}

fn salvage_request_id(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value
        .get("requestId")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
