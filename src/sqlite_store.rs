//! SQLite-backed [`VectorStore`] implementation.
//!
//! A document replace runs inside one transaction (delete the old chunk
//! set, insert the new one), so concurrent readers see either version but
//! never a mix. Dense search is brute-force cosine over `dense_vectors`;
//! sparse search scores `sparse_terms` postings with BM25 IDF computed at
//! query time.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use rag_harness_core::embedding::{blob_to_vec, cosine_similarity, idf, vec_to_blob};
use rag_harness_core::error::StoreError;
use rag_harness_core::models::{Chunk, ChunkLevel, Document, SparseVector};
use rag_harness_core::store::{IndexedChunk, StoreHit, VectorStore};

const FINGERPRINT_KEY: &str = "vectorizer_fingerprint";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn hits_for(&self, scored: Vec<(String, f64)>) -> Result<Vec<StoreHit>, StoreError> {
        if scored.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT c.id, c.document_id, c.parent_id, c.text, d.title \
             FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE c.id IN ({})",
            placeholders(scored.len())
        );
        let mut query = sqlx::query(&sql);
        for (id, _) in &scored {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(read_err)?;
        let mut by_id: HashMap<String, SqliteRow> =
            rows.into_iter().map(|r| (r.get::<String, _>("id"), r)).collect();

        Ok(scored
            .into_iter()
            .filter_map(|(id, score)| {
                let row = by_id.remove(&id)?;
                Some(StoreHit {
                    chunk_id: id,
                    document_id: row.get("document_id"),
                    parent_id: row.get("parent_id"),
                    score,
                    text: row.get("text"),
                    title: row.get("title"),
                })
            })
            .collect())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    )
}

fn read_err(e: sqlx::Error) -> StoreError {
    if is_connection_error(&e) {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Query(e.to_string())
    }
}

fn write_err(e: sqlx::Error) -> StoreError {
    if is_connection_error(&e) {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Write(e.to_string())
    }
}

fn sort_desc(scored: &mut Vec<(String, f64)>, limit: usize) {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(limit);
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn replace_document(&self, doc: &Document, chunks: &[IndexedChunk]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(write_err)?;

        for table in ["sparse_terms", "dense_vectors", "chunks"] {
            sqlx::query(&format!("DELETE FROM {} WHERE document_id = ?", table))
                .bind(&doc.id)
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
        }

        sqlx::query(
            r#"
            INSERT INTO documents (id, title, source_timestamp, indexed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                source_timestamp = excluded.source_timestamp,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(doc.source_timestamp)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;

        for (ordinal, ic) in chunks.iter().enumerate() {
            let c = &ic.chunk;
            sqlx::query(
                "INSERT INTO chunks (id, document_id, parent_id, level, ordinal, start_offset, end_offset, text, hash) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&c.id)
            .bind(&doc.id)
            .bind(&c.parent_id)
            .bind(c.level.as_str())
            .bind(ordinal as i64)
            .bind(c.start_offset as i64)
            .bind(c.end_offset as i64)
            .bind(&c.text)
            .bind(&c.hash)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;

            let Some(emb) = &ic.embedding else { continue };
            sqlx::query("INSERT INTO dense_vectors (chunk_id, document_id, dims, embedding) VALUES (?, ?, ?, ?)")
                .bind(&c.id)
                .bind(&doc.id)
                .bind(emb.dense.len() as i64)
                .bind(vec_to_blob(&emb.dense))
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
            for (term, weight) in &emb.sparse {
                sqlx::query("INSERT INTO sparse_terms (chunk_id, document_id, term, weight) VALUES (?, ?, ?, ?)")
                    .bind(&c.id)
                    .bind(&doc.id)
                    .bind(i64::from(*term))
                    .bind(f64::from(*weight))
                    .execute(&mut *tx)
                    .await
                    .map_err(write_err)?;
            }
        }

        tx.commit().await.map_err(write_err)?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        for table in ["sparse_terms", "dense_vectors"] {
            sqlx::query(&format!("DELETE FROM {} WHERE document_id = ?", table))
                .bind(document_id)
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
        }
        let removed = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?
            .rows_affected();
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        tx.commit().await.map_err(write_err)?;
        Ok(removed as usize)
    }

    async fn dense_search(&self, query: &[f32], limit: usize) -> Result<Vec<StoreHit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT dv.chunk_id, dv.document_id, dv.embedding, c.parent_id, c.text, d.title
            FROM dense_vectors dv
            JOIN chunks c ON c.id = dv.chunk_id
            JOIN documents d ON d.id = dv.document_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)?;

        let mut hits: Vec<StoreHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let score = cosine_similarity(query, &blob_to_vec(&blob)) as f64;
                StoreHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    parent_id: row.get("parent_id"),
                    score,
                    text: row.get("text"),
                    title: row.get("title"),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn sparse_search(&self, query: &SparseVector, limit: usize) -> Result<Vec<StoreHit>, StoreError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dense_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)?;

        let sql = format!(
            "SELECT chunk_id, term, weight FROM sparse_terms WHERE term IN ({})",
            placeholders(query.len())
        );
        let mut q = sqlx::query(&sql);
        for term in query.keys() {
            q = q.bind(i64::from(*term));
        }
        let postings = q.fetch_all(&self.pool).await.map_err(read_err)?;

        let mut doc_freq: HashMap<i64, usize> = HashMap::new();
        for row in &postings {
            *doc_freq.entry(row.get::<i64, _>("term")).or_insert(0) += 1;
        }

        let mut scores: HashMap<String, f64> = HashMap::new();
        for row in &postings {
            let term: i64 = row.get("term");
            let weight: f64 = row.get("weight");
            let qw = u32::try_from(term)
                .ok()
                .and_then(|t| query.get(&t))
                .copied()
                .unwrap_or(0.0);
            let term_idf = idf(total as usize, doc_freq.get(&term).copied().unwrap_or(0));
            *scores.entry(row.get("chunk_id")).or_insert(0.0) += f64::from(qw * term_idf) * weight;
        }

        let mut scored: Vec<(String, f64)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
        sort_desc(&mut scored, limit);
        self.hits_for(scored).await
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, document_id, parent_id, level, start_offset, end_offset, text, hash \
             FROM chunks WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(read_err)?;

        let sql = format!(
            "SELECT id, parent_id FROM chunks WHERE parent_id IN ({}) ORDER BY ordinal",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for row in q.fetch_all(&self.pool).await.map_err(read_err)? {
            children
                .entry(row.get("parent_id"))
                .or_default()
                .push(row.get("id"));
        }

        rows.into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let level: String = row.get("level");
                Ok(Chunk {
                    child_ids: children.remove(&id).unwrap_or_default(),
                    document_id: row.get("document_id"),
                    parent_id: row.get("parent_id"),
                    level: ChunkLevel::parse(&level)
                        .ok_or_else(|| StoreError::Query(format!("bad chunk level '{}'", level)))?,
                    start_offset: row.get::<i64, _>("start_offset") as usize,
                    end_offset: row.get::<i64, _>("end_offset") as usize,
                    text: row.get("text"),
                    hash: row.get("hash"),
                    id,
                })
            })
            .collect()
    }

    async fn index_fingerprint(&self) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
            .bind(FINGERPRINT_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err)
    }

    async fn set_index_fingerprint(&self, fingerprint: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO index_meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(FINGERPRINT_KEY)
        .bind(fingerprint)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }
}
