//! Google Gemini provider using an API key (`GEMINI_API_KEY`,
//! `GOOGLE_API_KEY`, or config) against the public `generateContent` endpoint.

use crate::providers::traits::Provider;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Public API endpoint for API key users.
const PUBLIC_API_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    auth: Option<GeminiAuth>,
    api_base: String,
    client: Client,
}

/// Where the key came from; all variants are sent as `?key=`.
#[derive(Debug)]
enum GeminiAuth {
    ExplicitKey(String),
    EnvGeminiKey(String),
    EnvGoogleKey(String),
}

impl GeminiAuth {
    fn credential(&self) -> &str {
        match self {
            GeminiAuth::ExplicitKey(s) | GeminiAuth::EnvGeminiKey(s) | GeminiAuth::EnvGoogleKey(s) => s,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// API REQUEST/RESPONSE TYPES
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GeminiProvider {
    /// Create a new Gemini provider.
    ///
    /// Key priority: explicit key, then `GEMINI_API_KEY`, then `GOOGLE_API_KEY`.
    pub fn new(api_key: Option<&str>) -> Self {
        let auth = api_key
            .and_then(Self::normalize_non_empty)
            .map(GeminiAuth::ExplicitKey)
            .or_else(|| Self::load_non_empty_env("GEMINI_API_KEY").map(GeminiAuth::EnvGeminiKey))
            .or_else(|| Self::load_non_empty_env("GOOGLE_API_KEY").map(GeminiAuth::EnvGoogleKey));

        Self {
            auth,
            api_base: PUBLIC_API_ENDPOINT.to_string(),
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Point at a different endpoint (proxies, mock servers).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn normalize_non_empty(value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn load_non_empty_env(name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .and_then(|value| Self::normalize_non_empty(&value))
    }

    pub fn has_credentials(&self) -> bool {
        self.auth.is_some()
    }

    /// Human-readable credential source for startup logs.
    pub fn auth_source(&self) -> &'static str {
        match self.auth.as_ref() {
            Some(GeminiAuth::ExplicitKey(_)) => "config",
            Some(GeminiAuth::EnvGeminiKey(_)) => "GEMINI_API_KEY env var",
            Some(GeminiAuth::EnvGoogleKey(_)) => "GOOGLE_API_KEY env var",
            None => "none",
        }
    }

    fn format_model_name(model: &str) -> String {
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        }
    }

    fn build_generate_content_url(&self, model: &str, auth: &GeminiAuth) -> String {
        let model_name = Self::format_model_name(model);
        format!(
            "{}/{model_name}:generateContent?key={}",
            self.api_base,
            auth.credential()
        )
    }

    async fn send_generate_content(
        &self,
        request: &GenerateContentRequest,
        model: &str,
    ) -> anyhow::Result<String> {
        let auth = self.auth.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "Gemini API key not found. Options:\n\
                 1. Set GEMINI_API_KEY env var\n\
                 2. Set [normalizer] api_key in config.toml\n\
                 3. Get an API key from https://aistudio.google.com/app/apikey"
            )
        })?;

        let url = self.build_generate_content_url(model, auth);
        let response = self.client.post(&url).json(request).send().await.map_err(|e| {
            // reqwest errors echo the URL, which carries the key.
            anyhow::anyhow!(
                "Gemini request failed: {}",
                super::sanitize_api_error(&e.to_string())
            )
        })?;

        if !response.status().is_success() {
            return Err(super::api_error("Gemini", response).await);
        }

        let result: GenerateContentResponse = response.json().await?;
        if let Some(err) = result.error {
            anyhow::bail!("Gemini API error: {}", super::sanitize_api_error(&err.message));
        }

        result
            .candidates
            .and_then(|c| c.into_iter().next())
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("No response from Gemini"))
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn chat_with_system(
        &self,
        system_prompt: Option<&str>,
        message: &str,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<String> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: message.to_string(),
                }],
            }],
            system_instruction: system_prompt.map(|sys| Content {
                role: None,
                parts: vec![Part {
                    text: sys.to_string(),
                }],
            }),
            generation_config: GenerationConfig {
                temperature,
                max_output_tokens: 2048,
            },
        };

        self.send_generate_content(&request, model).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key(key: &str) -> GeminiProvider {
        GeminiProvider {
            auth: Some(GeminiAuth::ExplicitKey(key.into())),
            api_base: PUBLIC_API_ENDPOINT.into(),
            client: Client::new(),
        }
    }

    #[test]
    fn normalize_non_empty_trims_and_filters() {
        assert_eq!(
            GeminiProvider::normalize_non_empty("  key  "),
            Some("key".to_string())
        );
        assert_eq!(GeminiProvider::normalize_non_empty("   "), None);
    }

    #[test]
    fn explicit_key_wins() {
        let provider = GeminiProvider::new(Some("  explicit-key "));
        assert!(provider.has_credentials());
        assert_eq!(provider.auth_source(), "config");
    }

    #[test]
    fn model_name_formatting() {
        assert_eq!(
            GeminiProvider::format_model_name("gemini-1.5-flash"),
            "models/gemini-1.5-flash"
        );
        assert_eq!(
            GeminiProvider::format_model_name("models/gemini-1.5-flash"),
            "models/gemini-1.5-flash"
        );
    }

    #[test]
    fn api_key_url_uses_public_endpoint() {
        let provider = with_key("abc");
        let url = provider
            .build_generate_content_url("gemini-1.5-flash", provider.auth.as_ref().unwrap());
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent?key=abc"
        );
    }

    #[test]
    fn api_base_override_strips_trailing_slash() {
        let provider = with_key("abc").with_api_base("http://127.0.0.1:9999/v1beta/");
        let url = provider.build_generate_content_url("m", provider.auth.as_ref().unwrap());
        assert!(url.starts_with("http://127.0.0.1:9999/v1beta/models/m:generateContent"));
    }

    #[test]
    fn request_serialization() {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".into()),
                parts: vec![Part {
                    text: "Hello".into(),
                }],
            }],
            system_instruction: None,
            generation_config: GenerationConfig {
                temperature: 0.2,
                max_output_tokens: 2048,
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"role\":\"user\""));
        assert!(json.contains("\"maxOutputTokens\":2048"));
        assert!(!json.contains("systemInstruction"));
    }

    #[test]
    fn response_deserialization() {
        let json = r#"{"candidates":[{"content":{"parts":[{"text":"Price: 500"}]}}]}"#;
        let response: GenerateContentResponse = serde_json::from_str(json).unwrap();
        let text = response.candidates.unwrap()[0].content.parts[0].text.clone();
        assert_eq!(text.as_deref(), Some("Price: 500"));
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let provider = GeminiProvider {
            auth: None,
            api_base: PUBLIC_API_ENDPOINT.into(),
            client: Client::new(),
        };
        let err = provider
            .chat_with_system(None, "hi", "gemini-1.5-flash", 0.2)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("API key not found"));
    }
}
