//! Ingestion: chunk → vectorize → atomic index write.
//!
//! [`Ingestor::ingest_document`] chunks a document into parents and
//! children, embeds the children in batches with bounded parallelism, and
//! hands the whole chunk set to [`VectorStore::replace_document`] in one
//! call. Nothing is written until every batch has been embedded, so an
//! embedding failure leaves the previous version of the document intact.
//! A failed write is retried in full.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::{stream, StreamExt, TryStreamExt};
use tracing::{info, warn};

use rag_harness_core::chunk::{chunk_document, ChunkSpec};
use rag_harness_core::embedding::Vectorizer;
use rag_harness_core::error::RagError;
use rag_harness_core::models::{Document, EmbeddingPair};
use rag_harness_core::store::{ensure_fingerprint, IndexedChunk, VectorStore};

use crate::config::Config;
use crate::connector_fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestReport {
    pub parents: usize,
    pub children: usize,
}

pub struct Ingestor {
    store: Arc<dyn VectorStore>,
    vectorizer: Vectorizer,
    parent: ChunkSpec,
    child: ChunkSpec,
    batch_size: usize,
    concurrency: usize,
    write_attempts: u32,
}

impl Ingestor {
    pub fn new(store: Arc<dyn VectorStore>, vectorizer: Vectorizer) -> Self {
        Self {
            store,
            vectorizer,
            parent: ChunkSpec::PARENT,
            child: ChunkSpec::CHILD,
            batch_size: 64,
            concurrency: 4,
            write_attempts: 3,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn VectorStore>, vectorizer: Vectorizer) -> Self {
        Self {
            parent: config.parent_spec(),
            child: config.child_spec(),
            batch_size: config.embedding.batch_size.max(1),
            concurrency: config.embedding.concurrency.max(1),
            write_attempts: config.ingest.write_attempts.max(1),
            ..Self::new(store, vectorizer)
        }
    }

    pub fn with_batching(mut self, batch_size: usize, concurrency: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.concurrency = concurrency.max(1);
        self
    }

    /// Replace the indexed version of `doc`.
    ///
    /// Re-ingesting identical text produces identical chunk ids.
    pub async fn ingest_document(&self, doc: &Document) -> Result<IngestReport, RagError> {
        ensure_fingerprint(self.store.as_ref(), &self.vectorizer, true).await?;

        let chunks = chunk_document(&doc.id, &doc.text, &self.parent, &self.child);
        let texts: Vec<String> = chunks.children.iter().map(|c| c.text.clone()).collect();

        let batches: Vec<Vec<EmbeddingPair>> = stream::iter(texts.chunks(self.batch_size))
            .map(|batch| self.vectorizer.embed_documents(batch))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let report = IngestReport {
            parents: chunks.parents.len(),
            children: chunks.children.len(),
        };

        let mut indexed: Vec<IndexedChunk> = Vec::with_capacity(report.parents + report.children);
        indexed.extend(chunks.parents.into_iter().map(|chunk| IndexedChunk {
            chunk,
            embedding: None,
        }));
        indexed.extend(
            chunks
                .children
                .into_iter()
                .zip(batches.into_iter().flatten())
                .map(|(chunk, pair)| IndexedChunk {
                    chunk,
                    embedding: Some(pair),
                }),
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.replace_document(doc, &indexed).await {
                Ok(()) => break,
                Err(e) if attempt < self.write_attempts => {
                    warn!(document = %doc.id, attempt, error = %e, "index write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 << attempt.min(5))).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            document = %doc.id,
            parents = report.parents,
            children = report.children,
            "indexed document"
        );
        Ok(report)
    }

    /// Returns the number of chunks removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize, RagError> {
        let removed = self.store.delete_document(document_id).await?;
        info!(document = %document_id, removed, "deleted document");
        Ok(removed)
    }
}

/// `rag ingest`: index every matching file under the configured root.
pub async fn run_ingest(config: &Config, root: Option<std::path::PathBuf>) -> Result<()> {
    let Some(root) = root.or_else(|| config.ingest.root.clone()) else {
        bail!("No ingest root: pass --root or set [ingest].root");
    };

    let docs = connector_fs::scan_filesystem(&root, &config.ingest)?;
    let (_pool, store, vectorizer) = crate::open_index(config).await?;
    let ingestor = Ingestor::from_config(config, store, vectorizer);

    let mut report = IngestReport::default();
    let mut failed = 0usize;
    for doc in &docs {
        match ingestor.ingest_document(doc).await {
            Ok(r) => {
                report.parents += r.parents;
                report.children += r.children;
            }
            Err(e @ RagError::Embedding(rag_harness_core::error::EmbeddingError::ModelMismatch { .. })) => {
                return Err(e.into());
            }
            Err(e) => {
                warn!(document = %doc.id, error = %e, "document not indexed");
                failed += 1;
            }
        }
    }

    println!("ingest {}", root.display());
    println!("  documents: {}", docs.len() - failed);
    println!("  parent chunks: {}", report.parents);
    println!("  child chunks: {}", report.children);
    if failed > 0 {
        println!("  failed: {}", failed);
        bail!("{} document(s) failed to index", failed);
    }
    println!("ok");
    Ok(())
}

/// `rag delete <id>`.
pub async fn run_delete(config: &Config, document_id: &str) -> Result<()> {
    let (_pool, store, vectorizer) = crate::open_index(config).await?;
    let removed = Ingestor::from_config(config, store, vectorizer)
        .delete_document(document_id)
        .await?;
    if removed == 0 {
        bail!("Document not found: {}", document_id);
    }
    println!("deleted {} ({} chunks)", document_id, removed);
    Ok(())
}
