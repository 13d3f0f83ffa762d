use super::traits::{AttachmentRef, Channel, ChannelMessage, MediaPayload, SendMessage};
use crate::config::WhatsAppConfig;
use async_trait::async_trait;
use reqwest::{multipart, Client, Url};
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v18.0";
const GROUP_SUFFIX: &str = "@g.us";
const MEDIA_KINDS: [&str; 5] = ["image", "document", "video", "audio", "sticker"];

/// Refuse plain HTTP except towards the local machine.
fn ensure_https(url: &str) -> anyhow::Result<()> {
    let parsed = Url::parse(url)?;
    let loopback = matches!(parsed.host_str(), Some("127.0.0.1" | "localhost" | "[::1]"));
    if parsed.scheme() != "https" && !(parsed.scheme() == "http" && loopback) {
        anyhow::bail!(
            "Refusing to transmit sensitive data over non-HTTPS URL: URL scheme must be https"
        );
    }
    Ok(())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `WhatsApp` channel over the Business Cloud API.
///
/// Inbound messages arrive through the gateway's `/whatsapp` webhook and are
/// turned into [`ChannelMessage`]s by [`WhatsAppChannel::parse_webhook_payload`].
/// Outbound text goes to `/{phone_number_id}/messages`; media is uploaded to
/// `/{phone_number_id}/media` first and then referenced by id.
pub struct WhatsAppChannel {
    access_token: String,
    phone_number_id: String,
    verify_token: String,
    api_base: String,
    client: Client,
}

impl WhatsAppChannel {
    pub fn new(access_token: String, phone_number_id: String, verify_token: String) -> Self {
        Self {
            access_token,
            phone_number_id,
            verify_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn from_config(config: &WhatsAppConfig) -> Self {
        let channel = Self::new(
            config.access_token.clone(),
            config.phone_number_id.clone(),
            config.verify_token.clone(),
        );
        match config.api_base.as_deref().map(str::trim) {
            Some(base) if !base.is_empty() => channel.with_api_base(base),
            _ => channel,
        }
    }

    /// Point the channel at another Graph API base, e.g. a local mock.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Get the verify token for webhook verification
    pub fn verify_token(&self) -> &str {
        &self.verify_token
    }

    /// Parse an incoming webhook payload from Meta and extract messages.
    ///
    /// Senders are normalized to `+<digits>`. Messages that carry a
    /// `group_id` are attributed to `<group_id>@g.us`.
    pub fn parse_webhook_payload(&self, payload: &serde_json::Value) -> Vec<ChannelMessage> {
        let mut messages = Vec::new();

        // { "object": "whatsapp_business_account", "entry": [ { "changes": [ { "value": { "messages": [...] } } ] } ] }
        let Some(entries) = payload.get("entry").and_then(|e| e.as_array()) else {
            return messages;
        };

        for entry in entries {
            let Some(changes) = entry.get("changes").and_then(|c| c.as_array()) else {
                continue;
            };

            for change in changes {
                // Status callbacks carry no "messages" array.
                let Some(msgs) = change
                    .get("value")
                    .and_then(|v| v.get("messages"))
                    .and_then(|m| m.as_array())
                else {
                    continue;
                };

                for msg in msgs {
                    if let Some(parsed) = Self::parse_message(msg) {
                        messages.push(parsed);
                    }
                }
            }
        }

        messages
    }

    fn parse_message(msg: &serde_json::Value) -> Option<ChannelMessage> {
        let from = msg.get("from").and_then(|f| f.as_str())?.trim();
        if from.is_empty() {
            return None;
        }

        let sender = match msg.get("group_id").and_then(|g| g.as_str()) {
            Some(group) if !group.is_empty() => format!("{group}{GROUP_SUFFIX}"),
            _ if from.starts_with('+') => from.to_string(),
            _ => format!("+{from}"),
        };

        let kind = msg.get("type").and_then(|t| t.as_str()).unwrap_or("text");
        let (content, attachment) = if kind == "text" {
            let body = msg
                .get("text")
                .and_then(|t| t.get("body"))
                .and_then(|b| b.as_str())
                .unwrap_or_default();
            (body.to_string(), None)
        } else if MEDIA_KINDS.contains(&kind) {
            let media = msg.get(kind)?;
            let Some(id) = media.get("id").and_then(|i| i.as_str()) else {
                tracing::debug!("WhatsApp: {kind} message from {sender} has no media id");
                return None;
            };
            let caption = media
                .get("caption")
                .and_then(|c| c.as_str())
                .unwrap_or_default();
            let attachment = AttachmentRef {
                id: id.to_string(),
                mime_type: media
                    .get("mime_type")
                    .and_then(|m| m.as_str())
                    .map(str::to_string),
            };
            (caption.to_string(), Some(attachment))
        } else {
            tracing::debug!("WhatsApp: skipping unsupported {kind} message from {sender}");
            return None;
        };

        if content.trim().is_empty() && attachment.is_none() {
            return None;
        }

        let timestamp = msg
            .get("timestamp")
            .and_then(|t| t.as_str())
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or_else(unix_now);

        let id = msg
            .get("id")
            .and_then(|i| i.as_str())
            .filter(|i| !i.is_empty())
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

        Some(ChannelMessage {
            id,
            sender,
            content,
            channel: "whatsapp".to_string(),
            timestamp,
            attachment,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_base, self.phone_number_id)
    }

    /// Recipient id for the API and its `recipient_type`.
    fn recipient(recipient: &str) -> (&str, &'static str) {
        match recipient.strip_suffix(GROUP_SUFFIX) {
            Some(group) => (group, "group"),
            None => (recipient.strip_prefix('+').unwrap_or(recipient), "individual"),
        }
    }

    async fn post_message(&self, body: &serde_json::Value) -> anyhow::Result<()> {
        let url = self.messages_url();
        ensure_https(&url)?;

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = crate::providers::api_error("WhatsApp", resp).await;
            tracing::error!("WhatsApp send failed: {err}");
            return Err(err);
        }
        Ok(())
    }

    /// Upload media and return the id the Graph API assigned to it.
    async fn upload_media(&self, media: &MediaPayload) -> anyhow::Result<String> {
        let url = format!("{}/{}/media", self.api_base, self.phone_number_id);
        ensure_https(&url)?;

        let file_name = media
            .file_name
            .clone()
            .unwrap_or_else(|| "attachment".to_string());
        let part = multipart::Part::bytes(media.data.clone())
            .file_name(file_name)
            .mime_str(&media.mime_type)?;
        let form = multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", media.mime_type.clone())
            .part("file", part);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(crate::providers::api_error("WhatsApp media upload", resp).await);
        }

        let body: serde_json::Value = resp.json().await?;
        body.get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("WhatsApp media upload returned no id"))
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, message: &SendMessage) -> anyhow::Result<()> {
        let (to, recipient_type) = Self::recipient(&message.recipient);

        let body = match &message.media {
            None => serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": recipient_type,
                "to": to,
                "type": "text",
                "text": {
                    "preview_url": false,
                    "body": message.content
                }
            }),
            Some(media) => {
                let media_id = self.upload_media(media).await?;
                let kind = if media.mime_type.starts_with("image/") {
                    "image"
                } else {
                    "document"
                };
                let mut object = serde_json::json!({
                    "id": media_id,
                    "caption": message.content,
                });
                if kind == "document" {
                    if let Some(name) = &media.file_name {
                        object["filename"] = serde_json::Value::String(name.clone());
                    }
                }
                let mut body = serde_json::json!({
                    "messaging_product": "whatsapp",
                    "recipient_type": recipient_type,
                    "to": to,
                    "type": kind,
                });
                body[kind] = object;
                body
            }
        };

        self.post_message(&body).await
    }

    async fn listen(&self, _tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        // Webhook mode: the gateway pushes inbound messages.
        tracing::info!(
            "WhatsApp channel active (webhook mode). \
            Configure Meta webhook to POST to your gateway's /whatsapp endpoint."
        );

        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/{}", self.api_base, self.phone_number_id);

        if ensure_https(&url).is_err() {
            return false;
        }

        self.client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Resolve the media id to a download URL, then fetch the bytes.
    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> anyhow::Result<MediaPayload> {
        let meta_url = format!("{}/{}", self.api_base, attachment.id);
        ensure_https(&meta_url)?;

        let resp = self
            .client
            .get(&meta_url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(crate::providers::api_error("WhatsApp media lookup", resp).await);
        }

        let meta: serde_json::Value = resp.json().await?;
        let download_url = meta
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| anyhow::anyhow!("WhatsApp media {} has no download url", attachment.id))?;
        ensure_https(download_url)?;
        let mime_type = meta
            .get("mime_type")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| attachment.mime_type.clone())
            .unwrap_or_default();

        let resp = self
            .client
            .get(download_url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(crate::providers::api_error("WhatsApp media download", resp).await);
        }
        let data = resp.bytes().await?.to_vec();

        tracing::debug!(
            media_id = %attachment.id,
            bytes = data.len(),
            "WhatsApp media downloaded"
        );

        Ok(MediaPayload {
            mime_type,
            data,
            file_name: None,
        })
    }
}
