// notifier-rs/src/lib.rs
// Fire-and-forget HTML notifications for pipeline outcomes.
//
// The transport is a webhook POST; when no webhook is configured the
// client degrades to logging, matching the rest of the pipeline's
// never-block-on-notification stance.

use std::time::Duration;

use serde::Serialize;

use config_rs::NotifierConfig;

mod diff_html;

pub use diff_html::{render_changes_html, render_diff_html};

const SUCCESS_SUBJECT: &str =
    "[ SUCCESS @ SmartWorker ] - Failed job ran successfully with these changes!";
const FAILURE_SUBJECT: &str =
    "[ FAILURE @ SmartWorker ] - Failed job could not run successfully with these changes!";

#[derive(Debug, Serialize)]
struct NotificationPayload<'a> {
    subject: &'a str,
    html: &'a str,
}

/// Notification client. Sends are best-effort: every failure is logged
/// and swallowed so the pipeline outcome is never affected.
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(cfg: &NotifierConfig) -> Self {
        if !cfg.is_configured() {
            tracing::warn!("notification webhook not configured - notifications disabled");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            webhook_url: cfg.webhook_url.clone(),
        }
    }

    pub async fn send_success(&self, html: &str) {
        self.send(SUCCESS_SUBJECT, html).await;
    }

    pub async fn send_failure(&self, html: &str) {
        self.send(FAILURE_SUBJECT, html).await;
    }

    async fn send(&self, subject: &str, html: &str) {
        let Some(url) = &self.webhook_url else {
            tracing::warn!("no webhook configured - skipping notification");
            return;
        };

        let payload = NotificationPayload { subject, html };
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(subject, "notification sent");
            }
            Ok(response) => {
                tracing::error!(
                    subject,
                    status = response.status().as_u16(),
                    "notification endpoint rejected payload"
                );
            }
            Err(err) => {
                tracing::error!(subject, error = %err, "error sending notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_notifier_swallows_sends() {
        let notifier = Notifier::new(&NotifierConfig { webhook_url: None });
        // Must not panic or block; there is nothing to assert beyond
        // the call completing.
        notifier.send_success("<b>ok</b>").await;
        notifier.send_failure("<b>bad</b>").await;
    }

    #[test]
    fn payload_serializes_subject_and_html() {
        let payload = NotificationPayload {
            subject: "s",
            html: "<p>x</p>",
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["subject"], "s");
        assert_eq!(json["html"], "<p>x</p>");
    }
}
