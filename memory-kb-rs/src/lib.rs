// memory-kb-rs/src/lib.rs
// Vector-backed memory of previously resolved job failures.
//
// One episode = one metadata row (job identity + outcome) plus N embedding
// chunk rows, each tagged with a semantic category and a fixed weight.
// Chunks are cascade-deleted with their metadata row. The distance
// operator is whatever the deployed pgvector extension provides; the code
// only assumes smaller = more similar.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use ai_client::{AiClientError, EmbeddingGeneration};
use config_rs::{AiConfig, DbConfig};
use shared_types_rs::{
    CategorizedEmbedding, EmbeddingCategory, FailureContext, FailureEvent, MemorySearchResponse,
    MemorySearchResult,
};

pub mod ranking;

/// How many neighbors each per-category query pulls before blending.
const NEIGHBORS_PER_CATEGORY: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("embedding error: {0}")]
    Embedding(#[from] AiClientError),

    #[error("job id {0:?} is not numeric")]
    InvalidJobId(String),
}

/// The categorized vector memory index.
pub struct MemoryIndex {
    pool: PgPool,
    embedder: Arc<dyn EmbeddingGeneration>,
    vector_size: usize,
}

impl MemoryIndex {
    pub async fn connect(
        db: &DbConfig,
        ai: &AiConfig,
        embedder: Arc<dyn EmbeddingGeneration>,
    ) -> Result<Self, MemoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&db.url())
            .await?;

        Ok(Self {
            pool,
            embedder,
            vector_size: ai.vector_size,
        })
    }

    /// Create tables and indexes if they do not exist. Called once at
    /// service startup; failure here is fatal to the worker.
    pub async fn initialize(&self) -> Result<(), MemoryError> {
        tracing::debug!(action = "create_tables", "initializing memory schema");

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_failures_metadata (
                id BIGSERIAL PRIMARY KEY,
                job_id BIGINT NOT NULL UNIQUE,
                job_name TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                job_data JSONB,
                failed_reason TEXT,
                stacktrace TEXT,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER,
                retry_delay_ms INTEGER,
                timestamp_created TIMESTAMPTZ NOT NULL,
                timestamp_failed TIMESTAMPTZ NOT NULL DEFAULT now(),
                resolved BOOLEAN DEFAULT false,
                resolved_at TIMESTAMPTZ,
                resolution_summary TEXT,
                CONSTRAINT uq_job_failure UNIQUE (queue_name, job_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS job_failure_chunks (
                id BIGSERIAL PRIMARY KEY,
                job_failure_id BIGINT NOT NULL
                    REFERENCES job_failures_metadata(job_id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                category TEXT NOT NULL DEFAULT 'code_context',
                weight REAL NOT NULL DEFAULT 1.0,
                content TEXT NOT NULL,
                embedding VECTOR({}) NOT NULL
            )
            "#,
            self.vector_size
        ))
        .execute(&self.pool)
        .await?;

        // One statement per call; the driver prepares each query.
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_job_failures_metadata_lookup \
             ON job_failures_metadata (queue_name, job_id)",
            "CREATE INDEX IF NOT EXISTS idx_job_failures_metadata_failed_time \
             ON job_failures_metadata (timestamp_failed DESC)",
            "CREATE INDEX IF NOT EXISTS idx_job_failures_metadata_unresolved \
             ON job_failures_metadata (resolved) WHERE resolved = false",
            "CREATE INDEX IF NOT EXISTS idx_job_failure_chunks_category \
             ON job_failure_chunks (category)",
        ];
        for statement in indexes {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Embed a structured failure context into weighted per-category
    /// vectors: up to 1 error_signature, up to 3 failure_location, and 1
    /// metadata chunk. A failed embedding call drops that chunk only.
    pub async fn embed_context(&self, context: &FailureContext) -> Vec<CategorizedEmbedding> {
        embed_chunks(self.embedder.as_ref(), build_chunks(context)).await
    }

    /// Nearest-neighbor search restricted per category, blended by
    /// weighted distance. Returns the top k hits plus the signature-match
    /// fast-path flag.
    pub async fn search(
        &self,
        embeddings: &[CategorizedEmbedding],
        k: usize,
    ) -> Result<MemorySearchResponse, MemoryError> {
        tracing::debug!(
            action = "search",
            query_count = embeddings.len(),
            k,
            "searching job memory"
        );

        let mut merged: Vec<MemorySearchResult> = Vec::new();
        let mut signature_match = false;

        for emb in embeddings {
            let rows = sqlx::query(
                r#"
                SELECT id, job_failure_id, content, category, weight,
                       embedding <=> $1::vector AS distance
                FROM job_failure_chunks
                WHERE category = $2
                ORDER BY distance
                LIMIT $3
                "#,
            )
            .bind(format_vector(&emb.embedding))
            .bind(emb.category.as_str())
            .bind(NEIGHBORS_PER_CATEGORY)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let distance: f64 = row.try_get("distance")?;

                if ranking::is_signature_match(emb.category, distance) {
                    signature_match = true;
                }

                merged.push(MemorySearchResult {
                    id: row.try_get("id")?,
                    job_failure_id: row.try_get("job_failure_id")?,
                    content: row.try_get("content")?,
                    category: emb.category,
                    weight: row.try_get("weight")?,
                    distance,
                    weighted_distance: ranking::weighted_distance(distance, emb.weight),
                    query_chunk: emb.content.clone(),
                });
            }
        }

        Ok(MemorySearchResponse {
            results: ranking::rank_top_k(merged, k),
            signature_match,
        })
    }

    /// Persist one episode: the metadata row first, then one chunk row per
    /// embedding. A chunk insert failure is logged and skipped; it never
    /// rolls back the metadata row or the other chunks.
    pub async fn store(
        &self,
        event: &FailureEvent,
        resolved: bool,
        resolution_summary: &str,
        embeddings: &[CategorizedEmbedding],
    ) -> Result<(), MemoryError> {
        let job_id: i64 = event
            .id
            .parse()
            .map_err(|_| MemoryError::InvalidJobId(event.id.clone()))?;

        tracing::debug!(
            action = "store",
            job_id,
            resolved,
            embedding_count = embeddings.len(),
            "storing job episode"
        );

        sqlx::query(
            r#"
            INSERT INTO job_failures_metadata (
                job_id, job_name, queue_name, job_data, failed_reason,
                stacktrace, attempts_made, max_attempts, retry_delay_ms,
                timestamp_created, resolved, resolved_at, resolution_summary
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                CASE WHEN $11 THEN now() ELSE NULL END, $12
            )
            "#,
        )
        .bind(job_id)
        .bind(&event.name)
        .bind(&event.queue_name)
        .bind(&event.data)
        .bind(&event.failed_reason)
        .bind(event.stacktrace.last())
        .bind(event.attempts_made as i32)
        .bind(event.max_attempts.map(|a| a as i32))
        .bind(event.retry_delay_ms.map(|d| d as i32))
        .bind(event.timestamp)
        .bind(resolved)
        .bind(resolution_summary)
        .execute(&self.pool)
        .await?;

        for emb in embeddings {
            let insert = sqlx::query(
                r#"
                INSERT INTO job_failure_chunks
                    (job_failure_id, chunk_index, category, weight, content, embedding)
                VALUES ($1, $2, $3, $4, $5, $6::vector)
                "#,
            )
            .bind(job_id)
            .bind(emb.chunk_id)
            .bind(emb.category.as_str())
            .bind(emb.weight)
            .bind(&emb.content)
            .bind(format_vector(&emb.embedding))
            .execute(&self.pool)
            .await;

            if let Err(err) = insert {
                tracing::error!(
                    job_id,
                    chunk_index = emb.chunk_id,
                    error = %err,
                    "error inserting chunk"
                );
            }
        }

        Ok(())
    }

    /// Fetch the resolution summary stored for a past episode.
    pub async fn resolution_summary(
        &self,
        job_failure_id: i64,
    ) -> Result<Option<String>, MemoryError> {
        let row = sqlx::query(
            "SELECT resolution_summary FROM job_failures_metadata WHERE job_id = $1 LIMIT 1",
        )
        .bind(job_failure_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("resolution_summary")?),
            None => Ok(None),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Derive the chunk contents embedded for one failure context: the
/// normalized error signature, up to three failure-location chunks
/// (snippet-enriched when one was extracted for that site) and one job
/// metadata chunk.
pub fn build_chunks(context: &FailureContext) -> Vec<(EmbeddingCategory, String)> {
    let mut chunks: Vec<(EmbeddingCategory, String)> = Vec::new();

    chunks.push((
        EmbeddingCategory::ErrorSignature,
        context.error_signature.normalized_signature.clone(),
    ));

    for loc in context.failure_locations.iter().take(3) {
        let snippet = context
            .focused_snippets
            .iter()
            .find(|s| s.file_path == loc.file_path && s.failure_line == loc.line_number);
        let content = match snippet {
            Some(s) => format!("{}:{}\n{}", loc.file_path, loc.line_number, s.content),
            None => match &loc.function_name {
                Some(func) => format!(
                    "{} at {}:{}:{}",
                    func, loc.file_path, loc.line_number, loc.column_number
                ),
                None => format!("{}:{}:{}", loc.file_path, loc.line_number, loc.column_number),
            },
        };
        chunks.push((EmbeddingCategory::FailureLocation, content));
    }

    let metadata = serde_json::json!({
        "name": context.job.name,
        "id": context.job.id,
        "data": context.job.data,
    });
    chunks.push((EmbeddingCategory::Metadata, metadata.to_string()));

    chunks
}

/// Run the embedding collaborator over prepared chunks. Per-chunk
/// failures are logged and dropped without failing the rest.
pub async fn embed_chunks(
    embedder: &dyn EmbeddingGeneration,
    chunks: Vec<(EmbeddingCategory, String)>,
) -> Vec<CategorizedEmbedding> {
    let mut out = Vec::with_capacity(chunks.len());
    for (idx, (category, content)) in chunks.into_iter().enumerate() {
        match embedder.embed(&content).await {
            Ok(vector) => {
                out.push(CategorizedEmbedding::new(category, idx as i32, content, vector));
            }
            Err(err) => {
                tracing::warn!(
                    category = category.as_str(),
                    chunk_index = idx,
                    error = %err,
                    "embedding call failed, dropping chunk"
                );
            }
        }
    }
    out
}

/// Render a vector in the `[v1,v2,...]` literal form pgvector accepts.
fn format_vector(values: &[f32]) -> String {
    let mut out = String::with_capacity(values.len() * 10 + 2);
    out.push('[');
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shared_types_rs::{ErrorSignature, FailureLocation, FocusedSnippet, JobSummary};

    fn make_context() -> FailureContext {
        FailureContext {
            job: JobSummary {
                id: "42".to_string(),
                name: "start-worker".to_string(),
                data: serde_json::json!({ "num": 10 }),
            },
            stacktrace: "Error: boom\n    at processJob (/app/workers.ts:15:10)".to_string(),
            error_signature: ErrorSignature {
                error_type: "Error".to_string(),
                error_message: "Failed job 42".to_string(),
                normalized_signature: "Error: Failed job <ID>".to_string(),
            },
            failure_locations: vec![
                FailureLocation {
                    file_path: "/app/workers.ts".to_string(),
                    line_number: 15,
                    column_number: 10,
                    function_name: Some("processJob".to_string()),
                },
                FailureLocation {
                    file_path: "/app/index.ts".to_string(),
                    line_number: 42,
                    column_number: 5,
                    function_name: None,
                },
                FailureLocation {
                    file_path: "/app/a.ts".to_string(),
                    line_number: 1,
                    column_number: 1,
                    function_name: None,
                },
                FailureLocation {
                    file_path: "/app/b.ts".to_string(),
                    line_number: 2,
                    column_number: 2,
                    function_name: None,
                },
            ],
            focused_snippets: vec![FocusedSnippet {
                file_path: "/app/workers.ts".to_string(),
                start_line: 3,
                end_line: 27,
                failure_line: 15,
                content: ">>>   15: throw new Error(...)".to_string(),
            }],
            code_context: String::new(),
        }
    }

    /// Embedder that fails for contents containing a marker substring.
    struct FlakyEmbedder;

    #[async_trait]
    impl EmbeddingGeneration for FlakyEmbedder {
        async fn embed(&self, content: &str) -> Result<Vec<f32>, AiClientError> {
            if content.contains("index.ts") {
                Err(AiClientError::Network("connection refused".to_string()))
            } else {
                Ok(vec![0.1, 0.2])
            }
        }
    }

    #[test]
    fn build_chunks_caps_locations_at_three() {
        let chunks = build_chunks(&make_context());

        let signatures = chunks
            .iter()
            .filter(|(c, _)| *c == EmbeddingCategory::ErrorSignature)
            .count();
        let locations = chunks
            .iter()
            .filter(|(c, _)| *c == EmbeddingCategory::FailureLocation)
            .count();
        let metadata = chunks
            .iter()
            .filter(|(c, _)| *c == EmbeddingCategory::Metadata)
            .count();

        assert_eq!(signatures, 1);
        assert_eq!(locations, 3);
        assert_eq!(metadata, 1);
    }

    #[test]
    fn build_chunks_prefers_snippet_content_for_matching_site() {
        let chunks = build_chunks(&make_context());
        let first_location = chunks
            .iter()
            .find(|(c, _)| *c == EmbeddingCategory::FailureLocation)
            .unwrap();
        assert!(first_location.1.contains("throw new Error"));
    }

    #[tokio::test]
    async fn embed_chunks_drops_failed_items_only() {
        let chunks = build_chunks(&make_context());
        let total = chunks.len();

        let embeddings = embed_chunks(&FlakyEmbedder, chunks).await;

        // The index.ts location chunk fails to embed; everything else
        // survives with its category weight attached.
        assert_eq!(embeddings.len(), total - 1);
        assert!(embeddings
            .iter()
            .all(|e| (e.weight - e.category.weight()).abs() < f32::EPSILON));
    }

    #[test]
    fn format_vector_matches_pgvector_literal_form() {
        assert_eq!(format_vector(&[0.5, -1.0, 2.25]), "[0.5,-1,2.25]");
        assert_eq!(format_vector(&[]), "[]");
    }
}

