use async_trait::async_trait;
use thiserror::Error;

pub mod openai;

pub use openai::OpenAiClient;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider response was malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Http(reqwest::Error),

    #[error(transparent)]
    Api(async_openai::error::OpenAIError),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(e)
        }
    }
}

impl From<async_openai::error::OpenAIError> for ProviderError {
    fn from(e: async_openai::error::OpenAIError) -> Self {
        use async_openai::error::OpenAIError;
        match e {
            OpenAIError::Reqwest(e) => e.into(),
            OpenAIError::JSONDeserialize(e) => ProviderError::Malformed(e.to_string()),
            other => ProviderError::Api(other),
        }
    }
}

/// Single request/response text generation. Replies are untrusted text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Text embeddings; used identically for document chunks and for queries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}
