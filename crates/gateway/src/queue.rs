//! In-process queue consumer.
//!
//! Channel adapters and embedders enqueue normalized work items; the
//! consumer drains them one at a time (batch size 1, no batching delay).
//! Success acks by consuming; a handler error re-enqueues the item once,
//! then drops it with a log line.

use serde::Deserialize;
use tokio::sync::mpsc;

use sy_domain::channel::{ChannelAccountStatus, ChannelInboundMessage};
use sy_protocol::ChannelInboundParams;

use crate::state::GatewayState;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueMessage {
    Inbound {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "accountId")]
        account_id: String,
        message: ChannelInboundMessage,
    },
    Status {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "accountId")]
        account_id: String,
        status: ChannelAccountStatus,
    },
}

struct Envelope {
    message: QueueMessage,
    attempt: u32,
}

#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<Envelope>,
}

impl QueueSender {
    pub async fn enqueue(&self, message: QueueMessage) -> bool {
        self.tx
            .send(Envelope {
                message,
                attempt: 0,
            })
            .await
            .is_ok()
    }
}

pub fn spawn_consumer(state: GatewayState) -> QueueSender {
    let (tx, mut rx) = mpsc::channel::<Envelope>(256);
    let retry_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match handle(&state, envelope.message.clone()).await {
                Ok(()) => {}
                Err(e) if envelope.attempt == 0 => {
                    tracing::warn!(error = %e, "queue handler failed, retrying once");
                    // try_send: blocking on our own queue when it is full
                    // would wedge the consumer.
                    if retry_tx
                        .try_send(Envelope {
                            message: envelope.message,
                            attempt: 1,
                        })
                        .is_err()
                    {
                        state.logs.push("queue retry dropped: queue full".to_string());
                    }
                }
                Err(e) => {
                    state
                        .logs
                        .push(format!("queue message dropped after retry: {e}"));
                }
            }
        }
    });
    QueueSender { tx }
}

async fn handle(state: &GatewayState, message: QueueMessage) -> sy_domain::Result<()> {
    match message {
        QueueMessage::Inbound {
            channel_id,
            account_id,
            message,
        } => {
            crate::channels::inbound::handle_channel_inbound(
                state,
                ChannelInboundParams {
                    channel_id,
                    account_id,
                    message,
                },
            )
            .await?;
            Ok(())
        }
        QueueMessage::Status {
            channel_id,
            account_id,
            status,
        } => {
            state.logs.push(format!(
                "channel {channel_id}:{account_id} status {}{}",
                status.state,
                status
                    .detail
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default()
            ));
            Ok(())
        }
    }
}
