use crate::app::messages::{OutboundMessage, StatusUpdate};
use crate::domain::model::SupervisorEvent;
use crate::domain::ports::EventSink;
use crate::utils::error::{Result, SupervisorError};
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// 送出端：請求處理與監控任務都透過同一個佇列輸出
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// 佇列已關閉時只記錄，不回傳錯誤
    pub fn send(&self, message: OutboundMessage) {
        let message_type = message.message_type();
        if self.tx.send(message).is_err() {
            tracing::warn!("Outbound channel closed, dropping {} message", message_type);
        }
    }
}

#[async_trait]
impl EventSink for Outbound {
    async fn status_update(&self, request_id: &str, status: &str, message: &str) {
        self.send(OutboundMessage::StatusUpdate {
            request_id: request_id.to_string(),
            update: StatusUpdate {
                status: status.to_string(),
                message: message.to_string(),
            },
        });
    }

    async fn server_event(&self, event: SupervisorEvent) {
        self.send(OutboundMessage::ServerEvent(event));
    }
}

/// 將佇列中的訊息以 JSON lines 寫出，直到所有送出端都關閉
pub async fn write_lines<W>(mut rx: mpsc::UnboundedReceiver<OutboundMessage>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let message_type = message.message_type();
        let line = match message.into_envelope().and_then(|envelope| envelope.to_line()) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to encode {} message: {}", message_type, e);
                continue;
            }
        };

        let written: std::io::Result<()> = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        written.map_err(|e| SupervisorError::Transport {
            message: format!("failed to write {} message: {}", message_type, e),
        })?;
        tracing::debug!("Sent {} message", message_type);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::messages::Response;

    #[tokio::test]
    async fn test_write_lines_outputs_one_envelope_per_line() {
        let (outbound, rx) = Outbound::channel();
        outbound.send(OutboundMessage::Response {
            request_id: "r1".to_string(),
            response: Response::failure("nope"),
        });
        outbound
            .status_update("r1", "workshop_download_start", "starting")
            .await;
        drop(outbound);

        let mut buffer: Vec<u8> = Vec::new();
        write_lines(rx, &mut buffer).await.unwrap();

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "response");
        assert_eq!(lines[0]["requestId"], "r1");
        assert_eq!(lines[0]["payload"]["success"], false);
        assert_eq!(lines[1]["type"], "statusUpdate");
        assert_eq!(lines[1]["payload"]["status"], "workshop_download_start");
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_does_not_fail() {
        let (outbound, rx) = Outbound::channel();
        drop(rx);
        outbound
            .server_event(SupervisorEvent::CrashDetected {
                server_name: "a".to_string(),
                pid: 1,
                error: String::new(),
            })
            .await;
    }
}
