//! Operator pump commands: validate, normalise, publish. Fire-and-forget;
//! the device never acknowledges.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::db::PumpStatus;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("action must be ON or OFF, got '{0}'")]
    Validation(String),
    #[error("failed to publish command: {0}")]
    Publish(#[from] PublishError),
}

/// Outbound half of the transport.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandAck {
    pub status: &'static str,
    pub action: PumpStatus,
}

/// Parse an operator action (case-insensitive, trims whitespace).
pub fn parse_action(action: &str) -> Result<PumpStatus, CommandError> {
    PumpStatus::parse(action).ok_or_else(|| CommandError::Validation(action.trim().to_string()))
}

#[derive(Clone)]
pub struct CommandDispatcher {
    publisher: Arc<dyn CommandPublisher>,
    topic: String,
}

impl CommandDispatcher {
    pub fn new(publisher: Arc<dyn CommandPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    pub async fn dispatch(&self, action: &str) -> Result<CommandAck, CommandError> {
        let action = parse_action(action)?;

        self.publisher.publish(&self.topic, action.as_str()).await?;
        info!(topic = %self.topic, action = action.as_str(), "pump command sent");

        Ok(CommandAck {
            status: "sent",
            action,
        })
    }
}


// ===========================================================================
// Tests
// ===========================================================================
