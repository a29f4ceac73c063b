//! Dispatch trigger channel.
//!
//! Workers publish after every finished job and admission publishes after
//! every submission, so the dispatcher reacts before its next tick.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::QueueResult;

pub const DISPATCH_CHANNEL: &str = "soundry:dispatch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchReason {
    JobFinished,
    Submitted,
    Resumed,
}

impl DispatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchReason::JobFinished => "job-finished",
            DispatchReason::Submitted => "submitted",
            DispatchReason::Resumed => "resumed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "job-finished" => Some(DispatchReason::JobFinished),
            "submitted" => Some(DispatchReason::Submitted),
            "resumed" => Some(DispatchReason::Resumed),
            _ => None,
        }
    }
}

#[async_trait]
pub trait DispatchNotifier: Send + Sync {
    async fn notify(&self, reason: DispatchReason) -> QueueResult<()>;
}

/// Redis Pub/Sub trigger.
pub struct DispatchChannel {
    client: redis::Client,
}

impl DispatchChannel {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Subscribe to triggers. Unknown payloads are skipped.
    pub async fn subscribe(
        &self,
    ) -> QueueResult<Pin<Box<dyn Stream<Item = DispatchReason> + Send>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(DISPATCH_CHANNEL).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            DispatchReason::parse(&payload)
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl DispatchNotifier for DispatchChannel {
    async fn notify(&self, reason: DispatchReason) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(DISPATCH_CHANNEL, reason.as_str()).await?;
        debug!(reason = reason.as_str(), "Published dispatch trigger");
        Ok(())
    }
}

/// In-process trigger.
#[derive(Debug, Clone, Default)]
pub struct LocalDispatch {
    notify: Arc<Notify>,
}

impl LocalDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next trigger.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

#[async_trait]
impl DispatchNotifier for LocalDispatch {
    async fn notify(&self, _reason: DispatchReason) -> QueueResult<()> {
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_format() {
        for reason in [
            DispatchReason::JobFinished,
            DispatchReason::Submitted,
            DispatchReason::Resumed,
        ] {
            assert_eq!(DispatchReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(DispatchReason::parse("noise"), None);
    }

    #[tokio::test]
    async fn test_local_trigger_is_remembered() {
        let local = LocalDispatch::new();
        local.notify(DispatchReason::Submitted).await.unwrap();
        // A permit stored before waiting completes immediately.
        local.notified().await;
    }
}
