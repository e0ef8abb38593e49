// repair-pipeline-rs/src/lib.rs
// The automated repair pipeline for jobs that exhausted their retries.
//
// One run is strictly sequential: context extraction -> memory search ->
// consensus -> fix synthesis -> sandbox verification -> memory write.
// Each stage consumes the previous stage's output; the only internal
// fan-out is ordered concurrent I/O (reading changed files).
//
// Collaborators are injected as explicit service objects. No stage
// retries internally: the job queue already exhausted its retry budget
// before this pipeline was invoked, and nothing here is allowed to
// propagate back into the queue's retry machinery.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use ai_client::TextGeneration;
use memory_kb::{MemoryError, MemoryIndex};
use notifier::{render_changes_html, Notifier};
use sandbox_runner::{SandboxOutcome, SandboxRunner};
use shared_types_rs::{
    CategorizedEmbedding, CodeChange, FailureContext, FailureEvent, MemorySearchResponse,
};

pub mod consensus;
pub mod context;
pub mod synthesis;

mod memory_writer;

pub use memory_writer::MemoryWriter;
pub use synthesis::SynthesisError;

#[cfg(test)]
mod tests;

/// How many blended hits the memory search returns per run.
const SEARCH_TOP_K: usize = 5;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Top-level error type for this crate. Only unrecovered steps surface
/// here; "no fix" and "verification failed" are ordinary outcomes.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),
}

/// Terminal outcome of one pipeline run.
#[derive(Debug)]
pub enum RunOutcome {
    /// The fix verified in the sandbox and the episode was committed.
    Fixed {
        changes: Vec<CodeChange>,
        resolution_summary: String,
    },
    /// A fix was synthesized but did not verify; nothing was stored.
    VerificationFailed { changes: Vec<CodeChange> },
    /// The model responded but no code changes could be parsed.
    NoFix,
    /// The text-generation collaborator was unreachable.
    ModelUnavailable,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Fixed { .. } => "fixed",
            RunOutcome::VerificationFailed { .. } => "verification_failed",
            RunOutcome::NoFix => "no_fix",
            RunOutcome::ModelUnavailable => "model_unavailable",
        }
    }
}

/// Memory collaborator seam. Implemented by the real index; tests use an
/// in-memory fake.
#[async_trait]
pub trait JobMemory: Send + Sync {
    async fn embed_context(&self, context: &FailureContext) -> Vec<CategorizedEmbedding>;

    async fn search(
        &self,
        embeddings: &[CategorizedEmbedding],
        k: usize,
    ) -> std::result::Result<MemorySearchResponse, MemoryError>;

    async fn store(
        &self,
        event: &FailureEvent,
        resolved: bool,
        resolution_summary: &str,
        embeddings: &[CategorizedEmbedding],
    ) -> std::result::Result<(), MemoryError>;

    async fn resolution_summary(
        &self,
        job_failure_id: i64,
    ) -> std::result::Result<Option<String>, MemoryError>;
}

#[async_trait]
impl JobMemory for MemoryIndex {
    async fn embed_context(&self, context: &FailureContext) -> Vec<CategorizedEmbedding> {
        MemoryIndex::embed_context(self, context).await
    }

    async fn search(
        &self,
        embeddings: &[CategorizedEmbedding],
        k: usize,
    ) -> std::result::Result<MemorySearchResponse, MemoryError> {
        MemoryIndex::search(self, embeddings, k).await
    }

    async fn store(
        &self,
        event: &FailureEvent,
        resolved: bool,
        resolution_summary: &str,
        embeddings: &[CategorizedEmbedding],
    ) -> std::result::Result<(), MemoryError> {
        MemoryIndex::store(self, event, resolved, resolution_summary, embeddings).await
    }

    async fn resolution_summary(
        &self,
        job_failure_id: i64,
    ) -> std::result::Result<Option<String>, MemoryError> {
        MemoryIndex::resolution_summary(self, job_failure_id).await
    }
}

/// Sandbox collaborator seam.
#[async_trait]
pub trait FixVerifier: Send + Sync {
    async fn verify(&self, event: &FailureEvent, changes: &[CodeChange]) -> SandboxOutcome;
}

#[async_trait]
impl FixVerifier for SandboxRunner {
    async fn verify(&self, event: &FailureEvent, changes: &[CodeChange]) -> SandboxOutcome {
        SandboxRunner::verify(self, event, changes).await
    }
}

/// Notification collaborator seam; sends are fire-and-forget.
#[async_trait]
pub trait PipelineNotifier: Send + Sync {
    async fn send_success(&self, html: &str);
    async fn send_failure(&self, html: &str);
}

#[async_trait]
impl PipelineNotifier for Notifier {
    async fn send_success(&self, html: &str) {
        Notifier::send_success(self, html).await
    }

    async fn send_failure(&self, html: &str) {
        Notifier::send_failure(self, html).await
    }
}

/// A precedent episode selected by consensus.
struct Precedent {
    job_failure_id: i64,
    summary: String,
}

/// The repair pipeline. One instance serves all runs; each run owns its
/// own sandbox session and shares only the memory store and container
/// runtime with concurrent runs.
pub struct RepairPipeline {
    ai: Arc<dyn TextGeneration>,
    memory: Arc<dyn JobMemory>,
    sandbox: Arc<dyn FixVerifier>,
    notifier: Arc<dyn PipelineNotifier>,
    root_dir: Option<PathBuf>,
}

impl RepairPipeline {
    pub fn new(
        ai: Arc<dyn TextGeneration>,
        memory: Arc<dyn JobMemory>,
        sandbox: Arc<dyn FixVerifier>,
        notifier: Arc<dyn PipelineNotifier>,
        root_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            ai,
            memory,
            sandbox,
            notifier,
            root_dir,
        }
    }

    /// Run the pipeline for one exhausted job. Failures here never
    /// propagate into the queue; the caller only logs the outcome.
    #[instrument(
        name = "job_failure_repair",
        skip(self, event),
        fields(job.id = %event.id, job.name = %event.name)
    )]
    pub async fn run(&self, event: &FailureEvent) -> Result<RunOutcome> {
        let result = self.execute(event).await;

        match &result {
            Ok(RunOutcome::Fixed { .. }) => {
                // Success notification already sent by the memory writer.
            }
            Ok(RunOutcome::VerificationFailed { changes }) => {
                tracing::warn!(job_id = %event.id, "fix did not verify in sandbox");
                self.notifier
                    .send_failure(&render_changes_html(changes))
                    .await;
            }
            Ok(RunOutcome::NoFix) => {
                tracing::warn!(job_id = %event.id, "no code changes parsed from model response");
                self.notifier
                    .send_failure("<p>No fix could be synthesized for this job failure.</p>")
                    .await;
            }
            Ok(RunOutcome::ModelUnavailable) => {
                tracing::error!(job_id = %event.id, "text-generation collaborator unreachable");
                self.notifier
                    .send_failure("<p>The fix model was unreachable; no fix was attempted.</p>")
                    .await;
            }
            Err(err) => {
                tracing::error!(job_id = %event.id, error = %err, "pipeline run failed");
                self.notifier
                    .send_failure(&format!("<p>Repair pipeline error: {}</p>", err))
                    .await;
            }
        }

        result
    }

    async fn execute(&self, event: &FailureEvent) -> Result<RunOutcome> {
        // Extraction never fails; it degrades.
        let context = context::extract(event).await;

        let embeddings = self.memory.embed_context(&context).await;
        let precedent = self.find_precedent(&embeddings).await;

        let mut prompt = context.render_prompt();
        match &precedent {
            Some(p) => {
                tracing::info!(precedent_job = p.job_failure_id, "similar resolved job found");
                prompt = synthesis::prepend_precedent(&prompt, p.job_failure_id, &p.summary);
            }
            None => tracing::info!("no similar resolved jobs"),
        }

        let messages = synthesis::build_fix_messages(&prompt);
        let response = match self.ai.complete(&messages).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "error connecting with fix model");
                return Ok(RunOutcome::ModelUnavailable);
            }
        };

        let parsed = synthesis::parse_code_changes(&response);
        if parsed.is_empty() {
            return Ok(RunOutcome::NoFix);
        }
        tracing::info!(change_count = parsed.len(), "fix parsed, testing in sandbox");

        let changes =
            synthesis::capture_originals(self.root_dir.as_deref(), parsed).await?;

        let outcome = self.sandbox.verify(event, &changes).await;
        if !outcome.success {
            return Ok(RunOutcome::VerificationFailed { changes });
        }

        let writer = MemoryWriter::new(
            self.ai.clone(),
            self.memory.clone(),
            self.notifier.clone(),
        );
        let resolution_summary = writer.commit(event, &context, &changes, &embeddings).await;

        Ok(RunOutcome::Fixed {
            changes,
            resolution_summary,
        })
    }

    /// Search memory and reduce the hits to a single precedent via
    /// majority vote. Any failure along the way degrades to "no
    /// precedent"; the fix attempt proceeds regardless.
    async fn find_precedent(&self, embeddings: &[CategorizedEmbedding]) -> Option<Precedent> {
        if embeddings.is_empty() {
            return None;
        }

        let response = match self.memory.search(embeddings, SEARCH_TOP_K).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "memory search failed; continuing without precedent");
                return None;
            }
        };

        if response.signature_match {
            tracing::info!("near-duplicate error signature found in memory");
        }

        if response.results.is_empty() {
            return None;
        }

        let ids: Vec<i64> = response.results.iter().map(|r| r.job_failure_id).collect();
        let winner = match consensus::majority_vote(&ids) {
            Ok(outcome) => outcome.winner().copied()?,
            Err(err) => {
                tracing::warn!(error = %err, "consensus failed");
                return None;
            }
        };

        match self.memory.resolution_summary(winner).await {
            Ok(Some(summary)) if !summary.is_empty() => Some(Precedent {
                job_failure_id: winner,
                summary,
            }),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load precedent summary");
                None
            }
        }
    }
}
