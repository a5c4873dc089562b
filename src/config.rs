use anyhow::{bail, Context, Result};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub public_base_url: String,
    pub signing_secret: String,
    pub max_upload_bytes: usize,
    pub signed_url_ttl: Duration,
    pub auth_url: String,
    pub auth_api_key: Option<String>,
    pub provider: ProviderConfig,
    pub pipeline: PipelineConfig,
}

/// Width of the `module_embeddings.embedding vector(1536)` column. Any `EMBEDDING_MODEL`
/// must produce vectors of exactly this length; changing models to a different
/// width needs a new migration as well.
pub const EMBEDDING_DIMENSIONS: usize = 1536;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
    pub generation_model: String,
    pub embedding_model: String,
    /// Expected vector length; replies of any other length are rejected.
    pub embedding_dimensions: usize,
    /// Upper bound for one call, retries included.
    pub timeout: Duration,
}

/// Knobs of the ingestion -> retrieval -> generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub retrieval_top_k: usize,
    pub questions_per_test: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            retrieval_top_k: 5,
            questions_per_test: 5,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("CHUNK_SIZE must be positive");
        }
        if self.chunk_overlap >= self.chunk_size {
            bail!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        if self.questions_per_test == 0 {
            bail!("QUESTIONS_PER_TEST must be positive");
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port: u16 = parsed("PORT", 8081);
        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            chunk_size: parsed("CHUNK_SIZE", defaults.chunk_size),
            chunk_overlap: parsed("CHUNK_OVERLAP", defaults.chunk_overlap),
            retrieval_top_k: parsed("RETRIEVAL_TOP_K", defaults.retrieval_top_k),
            questions_per_test: parsed("QUESTIONS_PER_TEST", defaults.questions_per_test),
        };
        pipeline.validate()?;

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            port,
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".into())),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| format!("http://localhost:{}", port))
                .trim_end_matches('/')
                .to_string(),
            signing_secret: required("SIGNING_SECRET")?,
            max_upload_bytes: parsed("MAX_UPLOAD_BYTES", 200 * 1024 * 1024),
            signed_url_ttl: Duration::from_secs(parsed("SIGNED_URL_TTL_SECS", 3600)),
            auth_url: required("AUTH_URL")?.trim_end_matches('/').to_string(),
            auth_api_key: env::var("AUTH_API_KEY").ok().filter(|s| !s.is_empty()),
            provider: ProviderConfig {
                api_key: required("OPENAI_API_KEY")?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".into())
                    .trim_end_matches('/')
                    .to_string(),
                generation_model: env::var("GENERATION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "text-embedding-3-small".into()),
                // Fixed by the schema, not by the environment.
                embedding_dimensions: EMBEDDING_DIMENSIONS,
                timeout: Duration::from_secs(parsed("PROVIDER_TIMEOUT_SECS", 60)),
            },
            pipeline,
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{} not set", key))
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_matches_reference_policy() {
        let p = PipelineConfig::default();
        assert_eq!((p.chunk_size, p.chunk_overlap), (1000, 200));
        assert_eq!(p.retrieval_top_k, 5);
        assert_eq!(p.questions_per_test, 5);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let p = PipelineConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..PipelineConfig::default()
        };
        assert!(p.validate().is_err());
    }
}
