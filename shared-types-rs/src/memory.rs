// shared-types-rs/src/memory.rs
// Categorized embeddings and memory search results.

use serde::{Deserialize, Serialize};

/// Raw distance below which an error-signature neighbor counts as a
/// near-duplicate of the current failure.
pub const SIGNATURE_MATCH_THRESHOLD: f64 = 0.15;

/// Semantic category of an embedding chunk. Each category carries a fixed
/// importance weight used to blend per-category distances into one ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingCategory {
    ErrorSignature,
    FailureLocation,
    CodeContext,
    Metadata,
}

impl EmbeddingCategory {
    /// Fixed category weight: error_signature > failure_location >
    /// code_context > metadata.
    pub fn weight(self) -> f32 {
        match self {
            EmbeddingCategory::ErrorSignature => 3.0,
            EmbeddingCategory::FailureLocation => 2.0,
            EmbeddingCategory::CodeContext => 1.0,
            EmbeddingCategory::Metadata => 0.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingCategory::ErrorSignature => "error_signature",
            EmbeddingCategory::FailureLocation => "failure_location",
            EmbeddingCategory::CodeContext => "code_context",
            EmbeddingCategory::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error_signature" => Some(EmbeddingCategory::ErrorSignature),
            "failure_location" => Some(EmbeddingCategory::FailureLocation),
            "code_context" => Some(EmbeddingCategory::CodeContext),
            "metadata" => Some(EmbeddingCategory::Metadata),
            _ => None,
        }
    }
}

/// One embedding vector with provenance. Generated per search/store call;
/// only persisted as a chunk row attached to a memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizedEmbedding {
    pub category: EmbeddingCategory,
    pub chunk_id: i32,
    pub content: String,
    pub embedding: Vec<f32>,
    pub weight: f32,
}

impl CategorizedEmbedding {
    pub fn new(category: EmbeddingCategory, chunk_id: i32, content: String, embedding: Vec<f32>) -> Self {
        Self {
            category,
            chunk_id,
            content,
            embedding,
            weight: category.weight(),
        }
    }
}

/// One nearest-neighbor hit against the stored episode chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySearchResult {
    pub id: i64,
    pub job_failure_id: i64,
    pub content: String,
    pub category: EmbeddingCategory,
    pub weight: f32,
    /// Distance as reported by the vector store; smaller = more similar.
    pub distance: f64,
    /// `distance / weight`; lower-weight categories are deprioritized.
    pub weighted_distance: f64,
    /// The query chunk that produced this hit.
    pub query_chunk: String,
}

/// Blended search output: the top-k hits across categories plus the
/// signature-match fast path flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySearchResponse {
    pub results: Vec<MemorySearchResult>,
    pub signature_match: bool,
}
