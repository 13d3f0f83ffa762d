use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Environment variable that overrides the config directory.
pub const CONFIG_DIR_ENV: &str = "INQUIRY_BROKER_CONFIG_DIR";
/// Environment variable that overrides `[whatsapp].app_secret`.
pub const WHATSAPP_APP_SECRET_ENV: &str = "INQUIRY_BROKER_WHATSAPP_APP_SECRET";
/// Environment variable that overrides `[broker].requester`.
pub const REQUESTER_ENV: &str = "INQUIRY_BROKER_REQUESTER";

const CONFIG_FILE: &str = "config.toml";
const TOPICS_FILE: &str = "topics.json";
const STATE_FILE: &str = "state.json";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level broker configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` / `INQUIRY_BROKER_CONFIG_DIR` env → `~/.inquiry-broker/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Routing and conversation settings (`[broker]`).
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Periodic expiry of stale conversations and topics (`[housekeeping]`).
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,

    /// Text normalizer used when assembling reports (`[normalizer]`).
    #[serde(default)]
    pub normalizer: NormalizerConfig,

    /// WhatsApp Business Cloud API transport (`[whatsapp]`).
    #[serde(default)]
    pub whatsapp: Option<WhatsAppConfig>,

    /// Webhook gateway bind address (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(CONFIG_FILE),
            broker: BrokerConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            normalizer: NormalizerConfig::default(),
            whatsapp: None,
            gateway: GatewayConfig::default(),
        }
    }
}

// ── Broker ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BrokerConfig {
    /// Identity of the single requester that issues inquiries and receives reports.
    #[serde(default)]
    pub requester: String,
    /// Sender suffix that marks group identities; their messages are ignored. Default: `"@g.us"`.
    #[serde(default = "default_group_suffix")]
    pub group_suffix: String,
    /// Exact sender identities that are always ignored. Default: `["status@broadcast"]`.
    #[serde(default = "default_ignored_senders")]
    pub ignored_senders: Vec<String>,
    /// Pause between forwarded attachments, in milliseconds. Default: `1500`.
    #[serde(default = "default_attachment_send_delay_ms")]
    pub attachment_send_delay_ms: u64,
    /// Maximum inbound messages processed concurrently. Default: `16`.
    #[serde(default = "default_max_in_flight_messages")]
    pub max_in_flight_messages: usize,
    /// Capacity of the inbound message queue. Default: `256`.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_group_suffix() -> String {
    "@g.us".into()
}

fn default_ignored_senders() -> Vec<String> {
    vec!["status@broadcast".into()]
}

fn default_attachment_send_delay_ms() -> u64 {
    1500
}

fn default_max_in_flight_messages() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            requester: String::new(),
            group_suffix: default_group_suffix(),
            ignored_senders: default_ignored_senders(),
            attachment_send_delay_ms: default_attachment_send_delay_ms(),
            max_in_flight_messages: default_max_in_flight_messages(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BrokerConfig {
    pub fn attachment_send_delay(&self) -> Duration {
        Duration::from_millis(self.attachment_send_delay_ms)
    }
}

// ── Housekeeping ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HousekeepingConfig {
    /// Minutes between sweeps. Default: `15`.
    #[serde(default = "default_sweep_interval_minutes")]
    pub interval_minutes: u64,
    /// Unfinished conversations older than this are expired. Default: `120`.
    #[serde(default = "default_conversation_ttl_minutes")]
    pub conversation_ttl_minutes: u64,
    /// Recent-topic entries older than this are dropped from correlation. Default: `24`.
    #[serde(default = "default_topic_retention_hours")]
    pub topic_retention_hours: u64,
}

fn default_sweep_interval_minutes() -> u64 {
    15
}

fn default_conversation_ttl_minutes() -> u64 {
    120
}

fn default_topic_retention_hours() -> u64 {
    24
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_sweep_interval_minutes(),
            conversation_ttl_minutes: default_conversation_ttl_minutes(),
            topic_retention_hours: default_topic_retention_hours(),
        }
    }
}

impl HousekeepingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1) * 60)
    }

    pub fn conversation_ttl(&self) -> chrono::Duration {
        i64::try_from(self.conversation_ttl_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn topic_retention(&self) -> chrono::Duration {
        i64::try_from(self.topic_retention_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }
}

// ── Normalizer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NormalizerConfig {
    /// Rewrite seller text through the model before forwarding. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Gemini API key. Falls back to `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model used for the rewrite. Default: `"gemini-1.5-flash"`.
    #[serde(default = "default_normalizer_model")]
    pub model: String,
    /// Sampling temperature. Default: `0.2`.
    #[serde(default = "default_normalizer_temperature")]
    pub temperature: f64,
    /// Upper bound for one normalizer call, in seconds. Default: `30`.
    #[serde(default = "default_normalizer_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override for the Gemini API.
    #[serde(default)]
    pub api_base: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_normalizer_model() -> String {
    "gemini-1.5-flash".into()
}

fn default_normalizer_temperature() -> f64 {
    0.2
}

fn default_normalizer_timeout_secs() -> u64 {
    30
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            model: default_normalizer_model(),
            temperature: default_normalizer_temperature(),
            timeout_secs: default_normalizer_timeout_secs(),
            api_base: None,
        }
    }
}

impl NormalizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

// ── Transport ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WhatsAppConfig {
    /// Access token from Meta Business Suite
    pub access_token: String,
    /// Phone number ID from Meta Business API
    pub phone_number_id: String,
    /// Webhook verify token (you define this, Meta sends it back for verification)
    pub verify_token: String,
    /// App secret for `X-Hub-Signature-256` verification.
    /// Can also be set via `INQUIRY_BROKER_WHATSAPP_APP_SECRET`.
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Graph API base URL override. Default: `https://graph.facebook.com/v18.0`.
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Bind host. Default: `"127.0.0.1"`.
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Bind port. Default: `42617`.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    42617
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

// ── Loading & saving ──────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".inquiry-broker"))
}

/// Resolve the config directory from the environment, falling back to `~/.inquiry-broker`.
pub fn resolve_config_dir() -> Result<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir.trim())),
        _ => default_config_dir(),
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let dir = resolve_config_dir()?;
        Self::load_or_init_in(&dir).await
    }

    /// Load `config.toml` from `dir`, writing a default one first if it is missing.
    pub async fn load_or_init_in(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let config_path = dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config
        } else {
            let config = Config {
                config_path,
                ..Config::default()
            };
            config.save().await?;
            tracing::info!(
                "Created default config at {}; set broker.requester before starting the daemon",
                config.config_path.display()
            );
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(requester) = non_empty_env(REQUESTER_ENV) {
            self.broker.requester = requester;
        }
        if let Some(secret) = non_empty_env(WHATSAPP_APP_SECRET_ENV) {
            if let Some(wa) = self.whatsapp.as_mut() {
                wa.app_secret = Some(secret);
            }
        }
    }

    fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Static topic → destinations mapping, next to `config.toml`.
    pub fn topics_path(&self) -> PathBuf {
        self.config_dir().join(TOPICS_FILE)
    }

    /// Durable broker snapshot, next to `config.toml`.
    pub fn state_path(&self) -> PathBuf {
        self.config_dir().join(STATE_FILE)
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.broker.requester.trim().is_empty() {
            anyhow::bail!(
                "broker.requester is empty; set it in {} or via {REQUESTER_ENV}",
                self.config_path.display()
            );
        }
        if self.broker.group_suffix.trim().is_empty() {
            anyhow::bail!("broker.group_suffix must not be empty");
        }
        if let Some(wa) = &self.whatsapp {
            if wa.access_token.trim().is_empty() || wa.phone_number_id.trim().is_empty() {
                anyhow::bail!("whatsapp.access_token and whatsapp.phone_number_id are required");
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        let parent_dir = self.config_dir().to_path_buf();

        fs::create_dir_all(&parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(&parent_dir).await?;
        Ok(())
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
