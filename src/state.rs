use std::{sync::Arc, time::Duration};

use crate::{
    auth::IdentityProvider,
    config::{Config, PipelineConfig},
    providers::{Embedder, LanguageModel},
    storage::ObjectStore,
    store::Store,
};

/// Request-time knobs copied out of [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub signed_url_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            signed_url_ttl: Duration::from_secs(3600),
        }
    }
}

impl From<&Config> for Settings {
    fn from(cfg: &Config) -> Self {
        Self {
            pipeline: cfg.pipeline,
            signed_url_ttl: cfg.signed_url_ttl,
        }
    }
}

/// Everything a handler needs, injected once at startup.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub model: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub objects: Arc<dyn ObjectStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub settings: Settings,
}
