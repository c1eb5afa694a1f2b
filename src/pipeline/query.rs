//! Model queries: send a rendered artifact and a task prompt to a VLM.
//!
//! [`ModelQuery`] is the seam the harness talks to. [`LlmModelQuery`]
//! implements it on top of `edgequake-llm`, which covers OpenAI, Anthropic,
//! Gemini, Ollama and the other providers behind one `LLMProvider` trait.
//!
//! Models are named `provider:model` (`"openai:gpt-4.1-nano"`). Providers
//! are created once per identifier and cached.
//!
//! ## Error classification
//!
//! Provider errors arrive as opaque messages. Rate limits, 5xx responses,
//! timeouts and connection resets are reported as
//! [`QueryError::Transient`] and retried by the harness; everything else
//! (bad credentials, unknown model, malformed request) is permanent.

use crate::config::QuerySettings;
use crate::error::QueryError;
use crate::pipeline::encode::encode_page_file;
use crate::pipeline::render::RenderedArtifact;
use crate::prompts::SYSTEM_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Asks a model about an artifact.
#[async_trait]
pub trait ModelQuery: Send + Sync {
    async fn query(&self, artifact: &RenderedArtifact, prompt: &str, model: &str) -> Result<String, QueryError>;
}

/// Split `provider:model`. The model part may itself contain colons
/// (`ollama:llama3.2-vision:11b`).
pub fn parse_model_id(id: &str) -> Option<(&str, &str)> {
    let (provider, model) = id.split_once(':')?;
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider, model))
}

const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "too many requests",
    "500",
    "502",
    "503",
    "504",
    "overloaded",
    "unavailable",
    "timeout",
    "timed out",
    "connection",
    "reset by peer",
    "temporarily",
];

/// Classify a provider error message.
pub fn classify_provider_error(message: &str) -> QueryError {
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        QueryError::Transient(message.to_string())
    } else {
        QueryError::Permanent(message.to_string())
    }
}

// ── edgequake-llm ────────────────────────────────────────────────────────

/// [`ModelQuery`] over `edgequake-llm` providers.
pub struct LlmModelQuery {
    settings: QuerySettings,
    fixed: Option<Arc<dyn LLMProvider>>,
    providers: Mutex<HashMap<String, Arc<dyn LLMProvider>>>,
}

impl LlmModelQuery {
    pub fn new(settings: QuerySettings) -> Self {
        Self {
            settings,
            fixed: None,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Route every model through one pre-built provider.
    pub fn with_provider(settings: QuerySettings, provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            fixed: Some(provider),
            ..Self::new(settings)
        }
    }

    fn provider(&self, model_id: &str) -> Result<Arc<dyn LLMProvider>, QueryError> {
        if let Some(p) = &self.fixed {
            return Ok(Arc::clone(p));
        }
        let (provider, model) = parse_model_id(model_id)
            .ok_or_else(|| QueryError::Permanent(format!("model '{model_id}' is not provider:model")))?;
        let mut cache = self
            .providers
            .lock()
            .map_err(|_| QueryError::Permanent("provider cache poisoned".into()))?;
        if let Some(p) = cache.get(model_id) {
            return Ok(Arc::clone(p));
        }
        let created = ProviderFactory::create_llm_provider(provider, model)
            .map_err(|e| QueryError::Permanent(format!("provider '{provider}' is not configured: {e}")))?;
        cache.insert(model_id.to_string(), Arc::clone(&created));
        Ok(created)
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.settings.temperature),
            max_tokens: Some(self.settings.max_tokens),
            ..Default::default()
        }
    }
}

async fn encode_pages(artifact: &RenderedArtifact) -> Result<Vec<ImageData>, QueryError> {
    let pages = artifact.pages.clone();
    tokio::task::spawn_blocking(move || {
        pages
            .iter()
            .map(|p| encode_page_file(p).map_err(|e| QueryError::Permanent(format!("{}: {e}", p.display()))))
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| QueryError::Permanent(format!("encode task panicked: {e}")))?
}

#[async_trait]
impl ModelQuery for LlmModelQuery {
    async fn query(&self, artifact: &RenderedArtifact, prompt: &str, model: &str) -> Result<String, QueryError> {
        let provider = self.provider(model)?;
        let images = encode_pages(artifact).await?;
        if images.is_empty() {
            return Err(QueryError::Permanent(format!("{} has no page images", artifact.id)));
        }

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user_with_images(prompt, images),
        ];
        let options = self.options();

        let start = Instant::now();
        let call = provider.chat(&messages, Some(&options));
        let response = match tokio::time::timeout(Duration::from_secs(self.settings.timeout_secs), call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(classify_provider_error(&format!("{}", e))),
            Err(_) => {
                return Err(QueryError::Transient(format!(
                    "no response within {}s",
                    self.settings.timeout_secs
                )))
            }
        };
        debug!(
            "{} / {}: {} input tokens, {} output tokens, {:?}",
            artifact.id,
            model,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ids_split_on_first_colon() {
        assert_eq!(parse_model_id("openai:gpt-4o"), Some(("openai", "gpt-4o")));
        assert_eq!(
            parse_model_id("ollama:llama3.2-vision:11b"),
            Some(("ollama", "llama3.2-vision:11b"))
        );
        assert_eq!(parse_model_id("gpt-4o"), None);
        assert_eq!(parse_model_id(":x"), None);
    }

    #[test]
    fn provider_errors_are_classified() {
        assert!(classify_provider_error("HTTP 429 Too Many Requests").is_transient());
        assert!(classify_provider_error("Request timed out").is_transient());
        assert!(classify_provider_error("503 Service Unavailable").is_transient());
        assert!(!classify_provider_error("401 invalid api key").is_transient());
        assert!(!classify_provider_error("model does not support images").is_transient());
    }

    #[test]
    fn completion_options_follow_settings() {
        let q = LlmModelQuery::new(QuerySettings::default());
        let opts = q.options();
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[tokio::test]
    async fn malformed_model_id_is_permanent() {
        let q = LlmModelQuery::new(QuerySettings::default());
        let artifact = RenderedArtifact {
            id: "v@digital".into(),
            variant_id: "v".into(),
            path: crate::pipeline::render::ReproductionPath::Digital,
            pages: vec![],
            pdf: None,
            content_hash: String::new(),
        };
        let err = q.query(&artifact, "p", "no-provider").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
