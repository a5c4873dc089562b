use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    providers::Embedder,
    store::Store,
};

/// The `k` chunks of `module_id` most similar to `query`, best first.
/// A module without chunks yields an empty list.
pub async fn retrieve(
    store: &dyn Store,
    embedder: &dyn Embedder,
    module_id: Uuid,
    query: &str,
    k: usize,
) -> AppResult<Vec<String>> {
    if k == 0 {
        return Ok(Vec::new());
    }

    let embedding = embedder
        .embed(&[query.to_string()])
        .await
        .map_err(|e| AppError::EmbeddingProviderError(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::EmbeddingProviderError("no embedding returned for query".into()))?;

    let chunks = store.nearest_chunks(module_id, &embedding, k).await?;
    tracing::debug!(%module_id, k, found = chunks.len(), "retrieved context");
    Ok(chunks)
}
