use async_trait::async_trait;

/// Reference to media held by the transport until it is downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub id: String,
    pub mime_type: Option<String>,
}

/// A message received from a channel
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub id: String,
    pub sender: String,
    /// Text body, or the caption when the message carries media.
    pub content: String,
    pub channel: String,
    pub timestamp: u64,
    pub attachment: Option<AttachmentRef>,
}

/// Binary payload of a downloaded or outgoing attachment
#[derive(Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
    pub file_name: Option<String>,
}

impl std::fmt::Debug for MediaPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPayload")
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// An outgoing message; `content` doubles as the caption when media is attached.
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub content: String,
    pub recipient: String,
    pub media: Option<MediaPayload>,
}

impl SendMessage {
    pub fn new(content: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            recipient: recipient.into(),
            media: None,
        }
    }

    pub fn with_media(mut self, media: MediaPayload) -> Self {
        self.media = Some(media);
        self
    }
}

/// Core channel trait, implemented per messaging platform
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Send a text or media message
    async fn send(&self, message: &SendMessage) -> anyhow::Result<()>;

    /// Start listening for incoming messages (long-running)
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> anyhow::Result<()>;

    /// Check if channel is healthy
    async fn health_check(&self) -> bool {
        true
    }

    /// Download the media behind an inbound attachment
    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> anyhow::Result<MediaPayload> {
        anyhow::bail!(
            "{} channel cannot download attachment {}",
            self.name(),
            attachment.id
        )
    }
}
