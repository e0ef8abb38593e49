// shared-types-rs/src/lib.rs
// Shared data model for the self-healing worker services.
//
// Everything in here is plain data: no I/O, no clients. The failure
// pipeline, the memory store and the sandbox runner all speak these
// types across crate boundaries.

pub mod failure;
pub mod memory;

pub use failure::{
    CodeChange, ErrorSignature, FailureContext, FailureEvent, FailureLocation, FocusedSnippet,
    JobSummary,
};
pub use memory::{
    CategorizedEmbedding, EmbeddingCategory, MemorySearchResponse, MemorySearchResult,
    SIGNATURE_MATCH_THRESHOLD,
};
