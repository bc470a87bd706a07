use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const AI_USER_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0a11);
pub const AI_NAME: &str = "AI Assistant";
pub const AI_TRIGGER: &str = "@ai";
pub const AI_FALLBACK: &str =
    "🤖 Sorry, the AI service is unavailable right now. Please try again later.";

/// Black-box text completion.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// The question after the `@ai` trigger, if the content is an AI request.
pub fn extract_prompt(content: &str) -> Option<&str> {
    let rest = content.trim_start().strip_prefix(AI_TRIGGER)?;
    if rest.chars().next().is_some_and(|c| !c.is_whitespace()) {
        // "@aiden" is a mention, not a request
        return None;
    }
    let prompt = rest.trim();
    (!prompt.is_empty()).then_some(prompt)
}

/// One attempt plus at most `retries` more. None once every attempt failed.
pub async fn complete_with_retry(
    provider: &dyn CompletionProvider,
    prompt: &str,
    retries: u32,
) -> Option<String> {
    for attempt in 0..=retries {
        match provider.complete(prompt).await {
            Ok(text) if !text.trim().is_empty() => return Some(text.trim().to_string()),
            Ok(_) => warn!("AI provider returned an empty completion (attempt {})", attempt + 1),
            Err(e) => warn!("AI provider failed (attempt {}): {:#}", attempt + 1, e),
        }
    }
    None
}

/// OpenAI-compatible chat-completions endpoint.
pub struct HttpCompletionProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl HttpCompletionProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building AI HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        })
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You are a helpful assistant in a group chat. Keep answers short.",
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response: ChatResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("completion response had no content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompletionProvider for Flaky {
        async fn complete(&self, prompt: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(anyhow!("boom"))
            } else {
                Ok(format!("answer to {prompt}"))
            }
        }
    }

    #[test]
    fn trigger_detection() {
        assert_eq!(extract_prompt("@ai what is rust?"), Some("what is rust?"));
        assert_eq!(extract_prompt("  @ai   hi "), Some("hi"));
        assert_eq!(extract_prompt("@ai"), None);
        assert_eq!(extract_prompt("@aiden hello"), None);
        assert_eq!(extract_prompt("hey @ai"), None);
    }

    #[tokio::test]
    async fn retries_once_then_gives_up() {
        let recovers = Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        };
        assert_eq!(
            complete_with_retry(&recovers, "q", 1).await.as_deref(),
            Some("answer to q")
        );

        let broken = Flaky {
            failures: 5,
            calls: AtomicU32::new(0),
        };
        assert_eq!(complete_with_retry(&broken, "q", 1).await, None);
        assert_eq!(broken.calls.load(Ordering::SeqCst), 2);
    }
}
