//! Rewrites a respondent's free text into labelled fields before it is
//! forwarded. Every failure falls back to the raw text.

use super::error::BrokerError;
use crate::config::NormalizerConfig;
use crate::providers::{GeminiProvider, Provider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait TextNormalizer: Send + Sync {
    fn name(&self) -> &str;

    async fn normalize(&self, raw: &str) -> anyhow::Result<String>;
}

pub fn extraction_prompt(raw: &str) -> String {
    format!(
        "Extract and format the following seller information in clean, simple format \
         without excessive asterisks or bold formatting:\n\n\"{raw}\"\n\n\
         Format it with simple sections like:\n\
         Price: [amount]\n\
         Quality: [description]\n\
         Delivery: [time]\n\
         Company: [name]\n\n\
         Keep it clean and readable."
    )
}

/// Normalizer backed by a chat provider, bounded by a timeout.
pub struct ProviderNormalizer {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f64,
    timeout: Duration,
}

impl ProviderNormalizer {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        temperature: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature,
            timeout,
        }
    }
}

#[async_trait]
impl TextNormalizer for ProviderNormalizer {
    fn name(&self) -> &str {
        "provider"
    }

    async fn normalize(&self, raw: &str) -> anyhow::Result<String> {
        let prompt = extraction_prompt(raw);
        let reply = tokio::time::timeout(
            self.timeout,
            self.provider.simple_chat(&prompt, &self.model, self.temperature),
        )
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {}s", self.timeout.as_secs()))??;

        let cleaned = reply.trim();
        if cleaned.is_empty() {
            anyhow::bail!("provider returned an empty rewrite");
        }
        Ok(cleaned.to_string())
    }
}

/// Used when no provider is configured; always defers to the raw text.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawTextNormalizer;

#[async_trait]
impl TextNormalizer for RawTextNormalizer {
    fn name(&self) -> &str {
        "raw"
    }

    async fn normalize(&self, _raw: &str) -> anyhow::Result<String> {
        anyhow::bail!("no normalizer configured")
    }
}

/// Build the normalizer described by `[normalizer]`.
pub fn from_config(config: &NormalizerConfig) -> Arc<dyn TextNormalizer> {
    if !config.enabled {
        tracing::info!("Text normalizer disabled; reports carry raw text");
        return Arc::new(RawTextNormalizer);
    }

    let mut provider = GeminiProvider::new(config.api_key.as_deref());
    if !provider.has_credentials() {
        tracing::warn!("No Gemini API key found; reports will carry raw text");
        return Arc::new(RawTextNormalizer);
    }
    if let Some(api_base) = config.api_base.as_deref() {
        provider = provider.with_api_base(api_base);
    }
    tracing::info!(
        model = %config.model,
        auth = provider.auth_source(),
        "Text normalizer ready"
    );
    Arc::new(ProviderNormalizer::new(
        Arc::new(provider),
        config.model.clone(),
        config.temperature,
        config.timeout(),
    ))
}

/// Normalized text, or the raw text when the normalizer fails. The flag is
/// `true` when the rewrite was used.
pub async fn normalize_or_raw(normalizer: &dyn TextNormalizer, raw: &str) -> (String, bool) {
    match normalizer.normalize(raw).await {
        Ok(text) => (text, true),
        Err(e) => {
            let err = BrokerError::Normalization(format!("{e:#}"));
            if normalizer.name() == "raw" {
                tracing::debug!("{err}");
            } else {
                tracing::warn!(normalizer = normalizer.name(), "{err}; using raw text");
            }
            (raw.to_string(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedProvider {
        reply: anyhow::Result<String>,
        delay: Duration,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat_with_system(
            &self,
            _system_prompt: Option<&str>,
            message: &str,
            _model: &str,
            _temperature: f64,
        ) -> anyhow::Result<String> {
            assert!(message.contains("Price: [amount]"));
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }

    fn normalizer(reply: anyhow::Result<String>, delay: Duration) -> ProviderNormalizer {
        ProviderNormalizer::new(
            Arc::new(ScriptedProvider { reply, delay }),
            "gemini-1.5-flash",
            0.2,
            Duration::from_millis(200),
        )
    }

    #[test]
    fn prompt_embeds_raw_text() {
        let prompt = extraction_prompt("500 per unit, ships monday");
        assert!(prompt.contains("\"500 per unit, ships monday\""));
        assert!(prompt.contains("Company: [name]"));
    }

    #[tokio::test]
    async fn provider_output_is_trimmed() {
        let n = normalizer(Ok("  Price: 500\n".into()), Duration::ZERO);
        assert_eq!(normalize_or_raw(&n, "price 500").await, ("Price: 500".into(), true));
    }

    #[tokio::test]
    async fn provider_error_falls_back_to_raw() {
        let n = normalizer(Err(anyhow::anyhow!("quota exceeded")), Duration::ZERO);
        assert_eq!(normalize_or_raw(&n, "price 500").await, ("price 500".into(), false));
    }

    #[tokio::test]
    async fn empty_output_counts_as_failure() {
        let n = normalizer(Ok("   ".into()), Duration::ZERO);
        assert!(n.normalize("price 500").await.is_err());
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let n = normalizer(Ok("Price: 500".into()), Duration::from_secs(60));
        let err = n.normalize("price 500").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn raw_normalizer_always_defers() {
        assert_eq!(
            normalize_or_raw(&RawTextNormalizer, "as typed").await,
            ("as typed".into(), false)
        );
    }

    #[test]
    fn disabled_config_yields_raw_normalizer() {
        let config = NormalizerConfig {
            enabled: false,
            ..NormalizerConfig::default()
        };
        assert_eq!(from_config(&config).name(), "raw");
    }
}
