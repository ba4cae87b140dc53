use super::{NotificationChannel, WipeNotice};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, notice: &WipeNotice) -> Value {
        match notice {
            WipeNotice::JobStarted { job_id, device_ids } => message(
                "Wipe Job Started",
                vec![
                    field("Job ID", &format!("`{}`", short(job_id))),
                    field("Devices", &device_ids.join(", ")),
                ],
                None,
            ),
            WipeNotice::DeviceWiped {
                job_id,
                device_id,
                device_model,
                method,
                certificate_id,
            } => message(
                "Device Wiped",
                vec![
                    field("Device", &format!("{} (`{}`)", device_model, device_id)),
                    field("Method", method),
                    field("Job ID", &format!("`{}`", short(job_id))),
                    field("Certificate", &format!("`{}`", certificate_id)),
                ],
                None,
            ),
            WipeNotice::DeviceFailed {
                job_id,
                device_id,
                error,
            } => message(
                "Device Wipe Failed",
                vec![
                    field("Device", &format!("`{}`", device_id)),
                    field("Job ID", &format!("`{}`", short(job_id))),
                ],
                Some(format!("*Error:*\n```{}```", error)),
            ),
            WipeNotice::JobFinished {
                job_id,
                succeeded,
                total,
            } => {
                let title = if succeeded == total {
                    "Wipe Job Complete"
                } else {
                    "Wipe Job Finished With Failures"
                };
                message(
                    title,
                    vec![
                        field("Job ID", &format!("`{}`", short(job_id))),
                        field("Certified", &format!("{} of {}", succeeded, total)),
                    ],
                    None,
                )
            }
        }
    }
}

fn short(id: &str) -> &str {
    &id[..8.min(id.len())]
}

fn field(label: &str, value: &str) -> Value {
    json!({
        "type": "mrkdwn",
        "text": format!("*{}:*\n{}", label, value)
    })
}

fn message(title: &str, fields: Vec<Value>, detail: Option<String>) -> Value {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": title,
                "emoji": true
            }
        }),
        json!({
            "type": "section",
            "fields": fields
        }),
    ];

    if let Some(text) = detail {
        blocks.push(json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": text
            }
        }));
    }

    json!({ "blocks": blocks })
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, notice: WipeNotice) -> Result<()> {
        let payload = self.format_message(&notice);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
