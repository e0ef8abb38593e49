use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ai_client::{AiClientError, ChatMessage, TextGeneration};
use memory_kb::MemoryError;
use sandbox_runner::SandboxOutcome;
use shared_types_rs::{
    CategorizedEmbedding, CodeChange, EmbeddingCategory, FailureContext, FailureEvent,
    MemorySearchResponse, MemorySearchResult,
};

use crate::{FixVerifier, JobMemory, PipelineNotifier, RepairPipeline, RunOutcome};

struct FakeModel {
    fix_response: Option<String>,
    summary_response: String,
    unreachable: bool,
    prompts: Mutex<Vec<String>>,
}

impl FakeModel {
    fn with_fix(fix: &str) -> Self {
        Self {
            fix_response: Some(fix.to_string()),
            summary_response: "Removed the intentional error path.".to_string(),
            unreachable: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn unreachable() -> Self {
        Self {
            fix_response: None,
            summary_response: String::new(),
            unreachable: true,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn fix_prompt(&self) -> String {
        self.prompts.lock().unwrap().first().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TextGeneration for FakeModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AiClientError> {
        if self.unreachable {
            return Err(AiClientError::Network("connection refused".to_string()));
        }

        let system = messages.first().map(|m| m.content.as_str()).unwrap_or("");
        let user = messages.get(1).map(|m| m.content.clone()).unwrap_or_default();

        if system.contains("**REWRITE**") {
            self.prompts.lock().unwrap().push(user);
            Ok(self.fix_response.clone().unwrap_or_default())
        } else {
            Ok(self.summary_response.clone())
        }
    }
}

#[derive(Default)]
struct FakeMemory {
    search_response: MemorySearchResponse,
    summaries: HashMap<i64, String>,
    stored: Mutex<Vec<(bool, String)>>,
}

impl FakeMemory {
    fn with_hits(ids: &[i64], summaries: HashMap<i64, String>) -> Self {
        let results = ids
            .iter()
            .map(|&job_failure_id| MemorySearchResult {
                id: job_failure_id,
                job_failure_id,
                content: "chunk".to_string(),
                category: EmbeddingCategory::ErrorSignature,
                weight: 3.0,
                distance: 0.2,
                weighted_distance: 0.2 / 3.0,
                query_chunk: "query".to_string(),
            })
            .collect();

        Self {
            search_response: MemorySearchResponse {
                results,
                signature_match: false,
            },
            summaries,
            stored: Mutex::new(Vec::new()),
        }
    }

    fn stored_episodes(&self) -> Vec<(bool, String)> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobMemory for FakeMemory {
    async fn embed_context(&self, _context: &FailureContext) -> Vec<CategorizedEmbedding> {
        vec![CategorizedEmbedding::new(
            EmbeddingCategory::ErrorSignature,
            0,
            "Error: Failed job <ID>".to_string(),
            vec![0.1, 0.2],
        )]
    }

    async fn search(
        &self,
        _embeddings: &[CategorizedEmbedding],
        _k: usize,
    ) -> Result<MemorySearchResponse, MemoryError> {
        Ok(self.search_response.clone())
    }

    async fn store(
        &self,
        _event: &FailureEvent,
        resolved: bool,
        resolution_summary: &str,
        _embeddings: &[CategorizedEmbedding],
    ) -> Result<(), MemoryError> {
        self.stored
            .lock()
            .unwrap()
            .push((resolved, resolution_summary.to_string()));
        Ok(())
    }

    async fn resolution_summary(
        &self,
        job_failure_id: i64,
    ) -> Result<Option<String>, MemoryError> {
        Ok(self.summaries.get(&job_failure_id).cloned())
    }
}

struct FakeVerifier {
    success: bool,
    calls: Mutex<usize>,
}

impl FakeVerifier {
    fn succeeding() -> Self {
        Self {
            success: true,
            calls: Mutex::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            success: false,
            calls: Mutex::new(0),
        }
    }

    fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl FixVerifier for FakeVerifier {
    async fn verify(&self, _event: &FailureEvent, _changes: &[CodeChange]) -> SandboxOutcome {
        *self.calls.lock().unwrap() += 1;
        SandboxOutcome {
            success: self.success,
            detail: String::new(),
        }
    }
}

#[derive(Default)]
struct RecordingNotifier {
    successes: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn counts(&self) -> (usize, usize) {
        (
            self.successes.lock().unwrap().len(),
            self.failures.lock().unwrap().len(),
        )
    }
}

#[async_trait]
impl PipelineNotifier for RecordingNotifier {
    async fn send_success(&self, html: &str) {
        self.successes.lock().unwrap().push(html.to_string());
    }

    async fn send_failure(&self, html: &str) {
        self.failures.lock().unwrap().push(html.to_string());
    }
}

fn make_event() -> FailureEvent {
    FailureEvent {
        id: "12".to_string(),
        name: "login".to_string(),
        queue_name: "login".to_string(),
        data: serde_json::json!({ "num": 10, "reasoning_fix": true }),
        stacktrace: vec![
            "Error: Failed job 12\n    at processJob (/app/workers.ts:15:10)".to_string(),
        ],
        failed_reason: Some("Failed job 12".to_string()),
        attempts_made: 5,
        max_attempts: Some(5),
        retry_delay_ms: Some(1000),
        timestamp: chrono::Utc::now(),
    }
}

struct Harness {
    model: Arc<FakeModel>,
    memory: Arc<FakeMemory>,
    verifier: Arc<FakeVerifier>,
    notifier: Arc<RecordingNotifier>,
    pipeline: RepairPipeline,
    _root: tempfile::TempDir,
}

fn make_harness(model: FakeModel, memory: FakeMemory, verifier: FakeVerifier) -> Harness {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("workers.ts"), "throw new Error('boom')").unwrap();

    let model = Arc::new(model);
    let memory = Arc::new(memory);
    let verifier = Arc::new(verifier);
    let notifier = Arc::new(RecordingNotifier::default());

    let pipeline = RepairPipeline::new(
        model.clone(),
        memory.clone(),
        verifier.clone(),
        notifier.clone(),
        Some(root.path().to_path_buf()),
    );

    Harness {
        model,
        memory,
        verifier,
        notifier,
        pipeline,
        _root: root,
    }
}

const FIX_RESPONSE: &str = "// File: workers.ts\n// FIX: handle the hazard instead of throwing\nreturn handleHazard();";

#[tokio::test]
async fn verified_fix_commits_episode_and_notifies_success() {
    let h = make_harness(
        FakeModel::with_fix(FIX_RESPONSE),
        FakeMemory::default(),
        FakeVerifier::succeeding(),
    );

    let outcome = h.pipeline.run(&make_event()).await.unwrap();

    match outcome {
        RunOutcome::Fixed {
            changes,
            resolution_summary,
        } => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].path, "workers.ts");
            assert_eq!(changes[0].original_code, "throw new Error('boom')");
            assert_eq!(resolution_summary, "Removed the intentional error path.");
        }
        other => panic!("expected Fixed, got {:?}", other.label()),
    }

    let stored = h.memory.stored_episodes();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].0, "episode stored as resolved");
    assert_eq!(stored[0].1, "Removed the intentional error path.");

    assert_eq!(h.verifier.call_count(), 1);
    assert_eq!(h.notifier.counts(), (1, 0));
}

#[tokio::test]
async fn sandbox_failure_notifies_failure_and_stores_nothing() {
    let h = make_harness(
        FakeModel::with_fix(FIX_RESPONSE),
        FakeMemory::default(),
        FakeVerifier::failing(),
    );

    let outcome = h.pipeline.run(&make_event()).await.unwrap();

    assert!(matches!(outcome, RunOutcome::VerificationFailed { .. }));
    assert!(h.memory.stored_episodes().is_empty());
    assert_eq!(h.notifier.counts(), (0, 1));
}

#[tokio::test]
async fn unreachable_model_is_no_fix_available() {
    let h = make_harness(
        FakeModel::unreachable(),
        FakeMemory::default(),
        FakeVerifier::succeeding(),
    );

    let outcome = h.pipeline.run(&make_event()).await.unwrap();

    assert!(matches!(outcome, RunOutcome::ModelUnavailable));
    // No sandbox run was attempted and nothing was stored.
    assert_eq!(h.verifier.call_count(), 0);
    assert!(h.memory.stored_episodes().is_empty());
    assert_eq!(h.notifier.counts(), (0, 1));
}

#[tokio::test]
async fn unparsable_response_is_a_normal_no_fix_outcome() {
    let h = make_harness(
        FakeModel::with_fix("Sorry, I cannot determine a fix for this."),
        FakeMemory::default(),
        FakeVerifier::succeeding(),
    );

    let outcome = h.pipeline.run(&make_event()).await.unwrap();

    assert!(matches!(outcome, RunOutcome::NoFix));
    assert_eq!(h.verifier.call_count(), 0);
    assert_eq!(h.notifier.counts(), (0, 1));
}

#[tokio::test]
async fn consensus_winner_prepends_precedent_summary() {
    let mut summaries = HashMap::new();
    summaries.insert(99, "Previously fixed by guarding the null branch.".to_string());

    let h = make_harness(
        FakeModel::with_fix(FIX_RESPONSE),
        FakeMemory::with_hits(&[99, 99, 99, 7, 8], summaries),
        FakeVerifier::succeeding(),
    );

    h.pipeline.run(&make_event()).await.unwrap();

    let prompt = h.model.fix_prompt();
    assert!(prompt.contains("PREVIOUS SIMILAR JOB RESOLUTION SUMMARY (JOB 99)"));
    assert!(prompt.contains("Previously fixed by guarding the null branch."));
}

#[tokio::test]
async fn tied_hits_produce_no_precedent_block() {
    let h = make_harness(
        FakeModel::with_fix(FIX_RESPONSE),
        FakeMemory::with_hits(&[1, 2, 3, 4, 5], HashMap::new()),
        FakeVerifier::succeeding(),
    );

    h.pipeline.run(&make_event()).await.unwrap();

    let prompt = h.model.fix_prompt();
    assert!(!prompt.contains("PREVIOUS SIMILAR JOB RESOLUTION SUMMARY"));
}

#[tokio::test]
async fn missing_root_dir_aborts_before_any_file_writes() {
    let model = Arc::new(FakeModel::with_fix(FIX_RESPONSE));
    let memory = Arc::new(FakeMemory::default());
    let verifier = Arc::new(FakeVerifier::succeeding());
    let notifier = Arc::new(RecordingNotifier::default());

    let pipeline = RepairPipeline::new(
        model,
        memory.clone(),
        verifier.clone(),
        notifier.clone(),
        None,
    );

    let result = pipeline.run(&make_event()).await;

    assert!(result.is_err());
    assert_eq!(verifier.call_count(), 0);
    assert!(memory.stored_episodes().is_empty());
    assert_eq!(notifier.counts(), (0, 1));
}
