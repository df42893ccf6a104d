//! Delivery transport trait and the recording test double

use async_trait::async_trait;
use std::sync::Mutex;

use tutorflow_utils::error::DeliveryError;

/// One recorded DM send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDm {
    pub chat_id: String,
    pub content: String,
    pub idempotency_key: String,
}

/// One recorded broadcast (send or edit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBroadcast {
    pub channel: String,
    pub content: String,
    /// Message id that was edited, `None` for a fresh post.
    pub edit_target: Option<String>,
}

/// The outbound messaging transport. Production implementations live
/// outside this workspace; both operations return the transport-assigned
/// message id, used to update the paired broadcast record.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Send one personal message. `idempotency_key` lets the transport
    /// deduplicate at-least-once retries.
    async fn send_dm(
        &self,
        chat_id: &str,
        content: &str,
        idempotency_key: &str,
    ) -> Result<String, DeliveryError>;

    /// Post to a broadcast channel, or edit the existing post when
    /// `edit_target` names one.
    async fn broadcast(
        &self,
        channel: &str,
        content: &str,
        edit_target: Option<&str>,
    ) -> Result<String, DeliveryError>;
}

/// Transport that records everything it is asked to send. Test seam.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    dms: Mutex<Vec<SentDm>>,
    broadcasts: Mutex<Vec<SentBroadcast>>,
    fail_next: Mutex<bool>,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next send fail with a transport error.
    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = true;
    }

    #[must_use]
    pub fn sent_dms(&self) -> Vec<SentDm> {
        self.dms.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    #[must_use]
    pub fn sent_broadcasts(&self) -> Vec<SentBroadcast> {
        self.broadcasts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn take_failure(&self) -> bool {
        let mut flag = self.fail_next.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *flag)
    }
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn send_dm(
        &self,
        chat_id: &str,
        content: &str,
        idempotency_key: &str,
    ) -> Result<String, DeliveryError> {
        if self.take_failure() {
            return Err(DeliveryError::Transport("scripted failure".into()));
        }
        let mut dms = self.dms.lock().unwrap_or_else(|p| p.into_inner());
        dms.push(SentDm {
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(format!("dm-{}", dms.len()))
    }

    async fn broadcast(
        &self,
        channel: &str,
        content: &str,
        edit_target: Option<&str>,
    ) -> Result<String, DeliveryError> {
        if self.take_failure() {
            return Err(DeliveryError::Transport("scripted failure".into()));
        }
        let mut broadcasts = self.broadcasts.lock().unwrap_or_else(|p| p.into_inner());
        broadcasts.push(SentBroadcast {
            channel: channel.to_string(),
            content: content.to_string(),
            edit_target: edit_target.map(str::to_string),
        });
        match edit_target {
            Some(target) => Ok(target.to_string()),
            None => Ok(format!("bc-{}", broadcasts.len())),
        }
    }
}
