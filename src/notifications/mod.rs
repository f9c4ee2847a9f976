//! Notification system for sending deployment and pipeline events via Slack,
//! Discord, generic webhooks and email.
//!
//! Delivery is fire-and-continue: failures are logged and never reach the
//! engine that emitted the event.

use anyhow::Result;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::db::{NotificationChannel, NotificationEventType, NotificationSubscription};

/// Notification payload with event details
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    pub event_type: NotificationEventType,
    /// "deployment" or "pipeline"
    pub subject: &'static str,
    /// Deployment id or pipeline execution id
    pub subject_id: String,
    /// Application or pipeline name
    pub name: String,
    pub environment: Option<String>,
    pub status: String,
    pub message: String,
    pub error_message: Option<String>,
    pub timestamp: String,
}

impl NotificationPayload {
    pub fn deployment_event(
        event_type: NotificationEventType,
        deployment_id: &str,
        application: &str,
        environment: &str,
        status: &str,
        message: String,
        error_message: Option<String>,
    ) -> Self {
        Self {
            event_type,
            subject: "deployment",
            subject_id: deployment_id.to_string(),
            name: application.to_string(),
            environment: Some(environment.to_string()),
            status: status.to_string(),
            message,
            error_message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn pipeline_event(
        event_type: NotificationEventType,
        execution_id: &str,
        pipeline_name: &str,
        status: &str,
        message: String,
        error_message: Option<String>,
    ) -> Self {
        Self {
            event_type,
            subject: "pipeline",
            subject_id: execution_id.to_string(),
            name: pipeline_name.to_string(),
            environment: None,
            status: status.to_string(),
            message,
            error_message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Get the title for the notification
    pub fn title(&self) -> String {
        match self.event_type {
            NotificationEventType::DeploymentStarted => format!("Deployment Started: {}", self.name),
            NotificationEventType::DeploymentCompleted => format!("Deployment Successful: {}", self.name),
            NotificationEventType::DeploymentFailed => format!("Deployment Failed: {}", self.name),
            NotificationEventType::DeploymentCancelled => format!("Deployment Cancelled: {}", self.name),
            NotificationEventType::QualityGateFailed => format!("Quality Gate Failed: {}", self.name),
            NotificationEventType::RollbackInitiated => format!("Rollback Initiated: {}", self.name),
            NotificationEventType::StageComplete => format!("Stage Complete: {}", self.name),
            NotificationEventType::PipelineSuccess => format!("Pipeline Succeeded: {}", self.name),
            NotificationEventType::PipelineFailure => format!("Pipeline Failed: {}", self.name),
            NotificationEventType::PipelineCancelled => format!("Pipeline Cancelled: {}", self.name),
        }
    }

    /// Get the color for the notification (for Slack/Discord)
    pub fn color(&self) -> &'static str {
        match self.event_type {
            NotificationEventType::DeploymentStarted | NotificationEventType::StageComplete => "#3498db",
            NotificationEventType::DeploymentCompleted | NotificationEventType::PipelineSuccess => "#2ecc71",
            NotificationEventType::DeploymentFailed
            | NotificationEventType::QualityGateFailed
            | NotificationEventType::PipelineFailure => "#e74c3c",
            NotificationEventType::DeploymentCancelled
            | NotificationEventType::RollbackInitiated
            | NotificationEventType::PipelineCancelled => "#f39c12",
        }
    }

    fn fields(&self) -> Vec<(&'static str, String, bool)> {
        let mut fields = vec![
            ("Name", self.name.clone(), true),
            ("Status", self.status.clone(), true),
        ];
        if let Some(env) = &self.environment {
            fields.push(("Environment", env.clone(), true));
        }
        fields.push(("ID", self.subject_id.clone(), true));
        if let Some(error) = &self.error_message {
            fields.push(("Error", error.clone(), false));
        }
        fields
    }
}

/// Sink for engine events
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `payload` to every subscription that wants it. Never fails.
    async fn notify(&self, subscriptions: &[NotificationSubscription], payload: &NotificationPayload);
}

/// Delivers deployment and pipeline events to subscribed channels
pub struct NotificationService {
    http_client: reqwest::Client,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationService {
    pub fn new() -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http_client }
    }

    async fn send_to_channel(&self, channel: &NotificationChannel, payload: &NotificationPayload) -> Result<()> {
        match channel {
            NotificationChannel::Slack { webhook_url } => self.send_slack(webhook_url, payload).await,
            NotificationChannel::Discord { webhook_url } => self.send_discord(webhook_url, payload).await,
            NotificationChannel::Webhook { url, headers } => self.send_webhook(url, headers, payload).await,
            NotificationChannel::Email { .. } => self.send_email(channel, payload).await,
        }
    }

    /// Send a Slack notification
    async fn send_slack(&self, webhook_url: &str, payload: &NotificationPayload) -> Result<()> {
        let fields: Vec<_> = payload
            .fields()
            .into_iter()
            .map(|(title, value, short)| json!({"title": title, "value": value, "short": short}))
            .collect();

        let message = json!({
            "attachments": [{
                "color": payload.color(),
                "title": payload.title(),
                "text": &payload.message,
                "fields": fields,
                "footer": "Conveyor",
                "ts": chrono::Utc::now().timestamp()
            }]
        });

        self.http_client
            .post(webhook_url)
            .json(&message)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    /// Send a Discord notification
    async fn send_discord(&self, webhook_url: &str, payload: &NotificationPayload) -> Result<()> {
        let fields: Vec<_> = payload
            .fields()
            .into_iter()
            .map(|(name, value, inline)| json!({"name": name, "value": value, "inline": inline}))
            .collect();

        let color_hex = payload.color().trim_start_matches('#');
        let color = i32::from_str_radix(color_hex, 16).unwrap_or(0x3498db);

        let message = json!({
            "embeds": [{
                "title": payload.title(),
                "description": &payload.message,
                "color": color,
                "fields": fields,
                "footer": {"text": "Conveyor"},
                "timestamp": &payload.timestamp
            }]
        });

        self.http_client
            .post(webhook_url)
            .json(&message)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }

    /// POST the raw payload as JSON
    async fn send_webhook(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        payload: &NotificationPayload,
    ) -> Result<()> {
        let mut request = self.http_client.post(url).json(payload);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }

    /// Send an email notification
    async fn send_email(&self, channel: &NotificationChannel, payload: &NotificationPayload) -> Result<()> {
        let NotificationChannel::Email {
            smtp_host,
            smtp_port,
            smtp_username,
            smtp_password,
            smtp_tls,
            from_address,
            to_addresses,
        } = channel
        else {
            anyhow::bail!("Not an email channel");
        };

        let from: Mailbox = from_address.parse()?;

        let rows: String = payload
            .fields()
            .iter()
            .map(|(label, value, _)| {
                format!(
                    r#"<div class="field"><span class="field-label">{}:</span> <span class="field-value">{}</span></div>"#,
                    label, value
                )
            })
            .collect();

        let html_body = format!(
            r#"
            <!DOCTYPE html>
            <html>
            <head>
                <style>
                    body {{ font-family: Arial, sans-serif; margin: 0; padding: 20px; background-color: #f5f5f5; }}
                    .container {{ max-width: 600px; margin: 0 auto; background-color: #ffffff; border-radius: 8px; }}
                    .header {{ background-color: {}; color: white; padding: 20px; text-align: center; }}
                    .content {{ padding: 20px; }}
                    .field {{ margin-bottom: 15px; }}
                    .field-label {{ font-weight: bold; color: #666; }}
                </style>
            </head>
            <body>
                <div class="container">
                    <div class="header"><h1>{}</h1></div>
                    <div class="content">
                        <p>{}</p>
                        {}
                    </div>
                </div>
            </body>
            </html>
            "#,
            payload.color(),
            payload.title(),
            payload.message,
            rows,
        );

        let text_body = format!(
            "{}\n\n{}\n\n{}\n\n---\nConveyor",
            payload.title(),
            payload.message,
            payload
                .fields()
                .iter()
                .map(|(label, value, _)| format!("{}: {}", label, value))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let mailer = if *smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host)
        }
        .port(*smtp_port);

        let mailer = if let (Some(username), Some(password)) = (smtp_username, smtp_password) {
            mailer.credentials(Credentials::new(username.clone(), password.clone()))
        } else {
            mailer
        };
        let mailer = mailer.build();

        for to_address in to_addresses {
            let to: Mailbox = to_address.parse()?;

            let email = Message::builder()
                .from(from.clone())
                .to(to)
                .subject(payload.title())
                .multipart(
                    MultiPart::alternative()
                        .singlepart(
                            SinglePart::builder()
                                .header(ContentType::TEXT_PLAIN)
                                .body(text_body.clone()),
                        )
                        .singlepart(
                            SinglePart::builder()
                                .header(ContentType::TEXT_HTML)
                                .body(html_body.clone()),
                        ),
                )?;

            mailer.send(email).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for NotificationService {
    async fn notify(&self, subscriptions: &[NotificationSubscription], payload: &NotificationPayload) {
        for subscription in subscriptions.iter().filter(|s| s.wants(payload.event_type)) {
            match self.send_to_channel(&subscription.channel, payload).await {
                Ok(()) => tracing::info!(
                    channel = subscription.channel.kind(),
                    event_type = %payload.event_type,
                    subject_id = %payload.subject_id,
                    "Notification sent"
                ),
                Err(e) => tracing::error!(
                    channel = subscription.channel.kind(),
                    event_type = %payload.event_type,
                    error = %e,
                    "Failed to send notification"
                ),
            }
        }
    }
}

/// Records every emitted event, for engine tests
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: std::sync::Mutex<Vec<(NotificationEventType, String)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEventType> {
        self.events.lock().unwrap().iter().map(|(e, _)| *e).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, _subscriptions: &[NotificationSubscription], payload: &NotificationPayload) {
        self.events
            .lock()
            .unwrap()
            .push((payload.event_type, payload.subject_id.clone()));
    }
}
