use std::error::Error;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs,
        EmbeddingInput,
    },
    Client,
};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;

use super::{Embedder, LanguageModel, ProviderError};
use crate::config::ProviderConfig;

const EMBED_BATCH: usize = 64;

/// OpenAI-compatible chat-completions and embeddings client.
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    generation_model: String,
    embedding_model: String,
    embedding_dimensions: usize,
}

impl OpenAiClient {
    pub fn new(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder().timeout(cfg.timeout).build().map_err(|error| {
            tracing::error!(error = &error as &dyn Error, "failed to build http client for openai");
            ProviderError::Http(error)
        })?;

        // 429 and 5xx are retried by the client; never past the call budget.
        let mut backoff_builder = ExponentialBackoffBuilder::default();
        backoff_builder.with_max_elapsed_time(Some(cfg.timeout));
        let backoff = backoff_builder.build();

        let config = OpenAIConfig::default()
            .with_api_base(&cfg.base_url)
            .with_api_key(&cfg.api_key);
        let client = Client::with_config(config)
            .with_http_client(http_client)
            .with_backoff(backoff);

        Ok(Self {
            client,
            generation_model: cfg.generation_model.clone(),
            embedding_model: cfg.embedding_model.clone(),
            embedding_dimensions: cfg.embedding_dimensions,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let message: ChatCompletionRequestMessage = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt)
            .build()?
            .into();
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.generation_model)
            .temperature(0.7)
            .messages(vec![message])
            .build()?;

        tracing::debug!(model = %self.generation_model, prompt_len = prompt.len(), "chat completion");
        let response = self.client.chat().create(request).await.map_err(|error| {
            tracing::warn!(error = &error as &dyn Error, "chat completion failed");
            ProviderError::from(error)
        })?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Malformed("no message content in completion".into()))
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH) {
            let request = CreateEmbeddingRequestArgs::default()
                .model(&self.embedding_model)
                .input(EmbeddingInput::StringArray(batch.to_vec()))
                .build()?;
            let mut response = self.client.embeddings().create(request).await?;
            if response.data.len() != batch.len() {
                return Err(ProviderError::Malformed(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    response.data.len()
                )));
            }
            if let Some(item) = response
                .data
                .iter()
                .find(|item| item.embedding.len() != self.embedding_dimensions)
            {
                return Err(ProviderError::Malformed(format!(
                    "{} returned {} dimensions, the index stores {}",
                    self.embedding_model,
                    item.embedding.len(),
                    self.embedding_dimensions
                )));
            }
            response.data.sort_by_key(|item| item.index);
            out.extend(response.data.into_iter().map(|item| item.embedding));
        }
        Ok(out)
    }
}
