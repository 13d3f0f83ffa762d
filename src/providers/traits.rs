use async_trait::async_trait;

/// A text-generation backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// One-shot chat with an optional system prompt.
    async fn chat_with_system(
        &self,
        system_prompt: Option<&str>,
        message: &str,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<String>;

    /// Simple one-shot chat (single user message, no explicit system prompt).
    async fn simple_chat(
        &self,
        message: &str,
        model: &str,
        temperature: f64,
    ) -> anyhow::Result<String> {
        self.chat_with_system(None, message, model, temperature)
            .await
    }
}
