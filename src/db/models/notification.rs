//! Notification channel and subscription models.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a notification is delivered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotificationChannel {
    Slack {
        webhook_url: String,
    },
    Discord {
        webhook_url: String,
    },
    /// Generic JSON webhook
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Email {
        smtp_host: String,
        #[serde(default = "default_smtp_port")]
        smtp_port: u16,
        #[serde(default)]
        smtp_username: Option<String>,
        #[serde(default)]
        smtp_password: Option<String>,
        #[serde(default = "default_smtp_tls")]
        smtp_tls: bool,
        from_address: String,
        to_addresses: Vec<String>,
    },
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_tls() -> bool {
    true
}

impl NotificationChannel {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Slack { .. } => "slack",
            Self::Discord { .. } => "discord",
            Self::Webhook { .. } => "webhook",
            Self::Email { .. } => "email",
        }
    }
}

/// Notification event types emitted by both engines
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEventType {
    DeploymentStarted,
    DeploymentCompleted,
    DeploymentFailed,
    DeploymentCancelled,
    QualityGateFailed,
    RollbackInitiated,
    #[serde(rename = "stage-complete")]
    StageComplete,
    #[serde(rename = "success")]
    PipelineSuccess,
    #[serde(rename = "failure")]
    PipelineFailure,
    #[serde(rename = "cancelled")]
    PipelineCancelled,
}

impl std::fmt::Display for NotificationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeploymentStarted => write!(f, "deployment_started"),
            Self::DeploymentCompleted => write!(f, "deployment_completed"),
            Self::DeploymentFailed => write!(f, "deployment_failed"),
            Self::DeploymentCancelled => write!(f, "deployment_cancelled"),
            Self::QualityGateFailed => write!(f, "quality_gate_failed"),
            Self::RollbackInitiated => write!(f, "rollback_initiated"),
            Self::StageComplete => write!(f, "stage-complete"),
            Self::PipelineSuccess => write!(f, "success"),
            Self::PipelineFailure => write!(f, "failure"),
            Self::PipelineCancelled => write!(f, "cancelled"),
        }
    }
}

/// A channel plus the events it wants to hear about.
///
/// An empty `events` list subscribes to everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationSubscription {
    pub channel: NotificationChannel,
    #[serde(default)]
    pub events: Vec<NotificationEventType>,
}

impl NotificationSubscription {
    pub fn wants(&self, event: NotificationEventType) -> bool {
        self.events.is_empty() || self.events.contains(&event)
    }
}
