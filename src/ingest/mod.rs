//! Document ingestion: object store -> plain text -> chunks -> embeddings ->
//! one batched write into the module's knowledge base.

use uuid::Uuid;

use crate::{
    config::PipelineConfig,
    error::{AppError, AppResult},
    models::NewChunk,
    providers::Embedder,
    storage::ObjectStore,
    store::Store,
};

pub mod chunk;
pub mod extract;

pub use chunk::TextSplitter;
pub use extract::{extract_text, DocumentFormat, ExtractError};

impl From<ExtractError> for AppError {
    fn from(e: ExtractError) -> Self {
        // Bytes the decoders cannot read are treated the same as a wrong extension.
        AppError::UnsupportedFormat(e.to_string())
    }
}

/// Downloads `path` from the object store and indexes it under `module_id`.
/// Returns the number of chunks written.
pub async fn ingest_document(
    store: &dyn Store,
    embedder: &dyn Embedder,
    objects: &dyn ObjectStore,
    cfg: &PipelineConfig,
    module_id: Uuid,
    path: &str,
) -> AppResult<u64> {
    let format = DocumentFormat::from_path(path)?;
    if store.module(module_id).await?.is_none() {
        return Err(AppError::NotFound("module"));
    }

    let bytes = objects
        .download(path)
        .await
        .map_err(|e| AppError::SourceUnavailable(e.to_string()))?;
    tracing::info!(%module_id, %path, size = bytes.len(), "ingesting document");

    ingest_bytes(store, embedder, cfg, module_id, format, bytes).await
}

/// Extract, split, embed and persist already-loaded document bytes.
pub async fn ingest_bytes(
    store: &dyn Store,
    embedder: &dyn Embedder,
    cfg: &PipelineConfig,
    module_id: Uuid,
    format: DocumentFormat,
    bytes: Vec<u8>,
) -> AppResult<u64> {
    // pdf-extract can panic on hostile input; a blocking task turns that into a JoinError.
    let text = tokio::task::spawn_blocking(move || extract_text(format, &bytes))
        .await
        .map_err(|e| AppError::UnsupportedFormat(format!("document decoder failed: {}", e)))??;

    let chunks = TextSplitter::new(cfg.chunk_size, cfg.chunk_overlap).split(&text);
    if chunks.is_empty() {
        tracing::warn!(%module_id, ?format, "document produced no text; nothing indexed");
        return Ok(0);
    }

    let vectors = embedder
        .embed(&chunks)
        .await
        .map_err(|e| AppError::EmbeddingProviderError(e.to_string()))?;
    if vectors.len() != chunks.len() {
        return Err(AppError::EmbeddingProviderError(format!(
            "expected {} embeddings, got {}",
            chunks.len(),
            vectors.len()
        )));
    }

    let rows: Vec<NewChunk> = chunks
        .into_iter()
        .zip(vectors)
        .enumerate()
        .map(|(i, (content, embedding))| NewChunk {
            chunk_index: i as i32,
            content,
            embedding,
        })
        .collect();

    let written = store.insert_chunks(module_id, &rows).await?;
    tracing::info!(%module_id, chunks = written, "document indexed");
    Ok(written)
}

/// Number of indexed chunks for a module.
pub async fn module_chunk_count(store: &dyn Store, module_id: Uuid) -> AppResult<i64> {
    Ok(store.chunk_count(module_id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewModule;
    use crate::store::MemoryStore;
    use crate::testing::{docx_bytes, pdf_bytes, FailingEmbedder, HashEmbedder, MemoryObjectStore};
    use test_log::test;

    async fn module(store: &MemoryStore) -> Uuid {
        store
            .create_module(NewModule {
                course_id: Uuid::new_v4(),
                title: "Cells".into(),
                description: "Cell biology".into(),
                is_diagnostic: false,
                created_by: None,
            })
            .await
            .unwrap()
            .id
    }

    fn small() -> PipelineConfig {
        PipelineConfig {
            chunk_size: 60,
            chunk_overlap: 10,
            ..PipelineConfig::default()
        }
    }

    #[test(tokio::test)]
    async fn word_document_is_chunked_and_indexed() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::default();
        let id = module(&store).await;
        let doc = docx_bytes(&[
            "Mitochondria produce most of the chemical energy of the cell.",
            "Ribosomes assemble proteins from amino acids.",
            "The nucleus stores genetic material.",
        ]);
        objects.upload("modules/c/m-1.docx", &doc).await.unwrap();

        let n = ingest_document(&store, &HashEmbedder, &objects, &small(), id, "modules/c/m-1.docx")
            .await
            .unwrap();
        assert!(n >= 3);
        assert_eq!(module_chunk_count(&store, id).await.unwrap(), n as i64);
    }

    #[test(tokio::test)]
    async fn unsupported_extension_is_rejected_before_download() {
        let store = MemoryStore::new();
        let id = module(&store).await;
        let err = ingest_document(&store, &HashEmbedder, &MemoryObjectStore::default(), &small(), id, "notes.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat(_)));
    }

    #[test(tokio::test)]
    async fn missing_object_is_source_unavailable() {
        let store = MemoryStore::new();
        let id = module(&store).await;
        let err = ingest_document(&store, &HashEmbedder, &MemoryObjectStore::default(), &small(), id, "gone.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SourceUnavailable(_)));
    }

    #[test(tokio::test)]
    async fn embedding_failure_writes_nothing() {
        let store = MemoryStore::new();
        let id = module(&store).await;
        let doc = docx_bytes(&["Some text worth indexing."]);
        let err = ingest_bytes(&store, &FailingEmbedder, &small(), id, DocumentFormat::Word, doc)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EmbeddingProviderError(_)));
        assert_eq!(store.chunk_count(id).await.unwrap(), 0);
    }

    #[test(tokio::test)]
    async fn empty_document_indexes_zero_chunks() {
        let store = MemoryStore::new();
        let id = module(&store).await;
        let doc = docx_bytes(&["   "]);
        let n = ingest_bytes(&store, &HashEmbedder, &small(), id, DocumentFormat::Word, doc)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test(tokio::test)]
    async fn garbage_word_bytes_are_unsupported() {
        let store = MemoryStore::new();
        let id = module(&store).await;
        let err = ingest_bytes(&store, &HashEmbedder, &small(), id, DocumentFormat::Word, b"nope".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat(_)));
    }

    #[test(tokio::test)]
    async fn pdf_document_is_indexed() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::default();
        let id = module(&store).await;
        let doc = pdf_bytes(&["Osmosis moves water across a membrane", "Diffusion needs no energy"]);
        objects.upload("modules/c/m-1.pdf", &doc).await.unwrap();

        let n = ingest_document(&store, &HashEmbedder, &objects, &small(), id, "modules/c/m-1.pdf")
            .await
            .unwrap();
        assert!(n >= 1);
        let hits = store.nearest_chunks(id, &HashEmbedder::vector("Osmosis"), 5).await.unwrap();
        assert!(hits.iter().any(|c| c.contains("Osmosis")), "{:?}", hits);
    }

    #[test(tokio::test)]
    async fn garbage_pdf_bytes_are_unsupported() {
        let store = MemoryStore::new();
        let id = module(&store).await;
        let junk = b"%PDF-1.7\n\x00\xff garbage without objects or xref".to_vec();
        let err = ingest_bytes(&store, &HashEmbedder, &small(), id, DocumentFormat::Pdf, junk)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedFormat(_)));
        assert_eq!(store.chunk_count(id).await.unwrap(), 0);
    }
}
