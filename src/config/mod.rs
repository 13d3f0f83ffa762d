pub mod schema;

pub use schema::{
    resolve_config_dir, BrokerConfig, Config, GatewayConfig, HousekeepingConfig, NormalizerConfig,
    WhatsAppConfig, CONFIG_DIR_ENV, REQUESTER_ENV, WHATSAPP_APP_SECRET_ENV,
};

/// JSON Schema of `config.toml`, for editor tooling.
pub fn schema_json() -> anyhow::Result<String> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_string_pretty(&schema)?)
}
