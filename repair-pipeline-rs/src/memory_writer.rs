// repair-pipeline-rs/src/memory_writer.rs
// Commits a verified episode back into memory and announces the result.
//
// Only invoked on verified sandbox success. A summary-generation failure
// yields an empty summary; it never revokes the verified outcome.

use std::sync::Arc;

use ai_client::{ChatMessage, TextGeneration};
use notifier::render_changes_html;
use shared_types_rs::{CategorizedEmbedding, CodeChange, FailureContext, FailureEvent};

use crate::{JobMemory, PipelineNotifier};

const SUMMARY_SYSTEM_PROMPT: &str = r#"You are a senior software engineer.

Your task is to write a **concise resolution summary** explaining how the job failure was fixed.

STRICT OUTPUT RULES:
1. **CONTENT:**
   - Explain the **root cause** of the failure.
   - Explain the **specific fix applied**.
   - Focus on logic and behavior, not formatting or instructions.

2. **FORMAT:**
   - Output a **single short paragraph only**.
   - No bullet points, no headings, no markdown.
   - No code.

3. **STYLE:**
   - Technical, clear, production-quality.
   - No references to prompts, instructions, or tooling.
   - Write as if for an incident or change log.

Input: Original code and fixed code.
Output: One short resolution summary paragraph."#;

pub struct MemoryWriter {
    ai: Arc<dyn TextGeneration>,
    memory: Arc<dyn JobMemory>,
    notifier: Arc<dyn PipelineNotifier>,
}

impl MemoryWriter {
    pub fn new(
        ai: Arc<dyn TextGeneration>,
        memory: Arc<dyn JobMemory>,
        notifier: Arc<dyn PipelineNotifier>,
    ) -> Self {
        Self {
            ai,
            memory,
            notifier,
        }
    }

    /// Generate the resolution summary, store the resolved episode and
    /// send the success notification. Returns the summary (possibly
    /// empty).
    pub async fn commit(
        &self,
        event: &FailureEvent,
        context: &FailureContext,
        changes: &[CodeChange],
        embeddings: &[CategorizedEmbedding],
    ) -> String {
        let summary = self.generate_summary(context, changes).await;
        tracing::info!(job_id = %event.id, summary_len = summary.len(), "resolution summary generated");

        if let Err(err) = self.memory.store(event, true, &summary, embeddings).await {
            tracing::error!(job_id = %event.id, error = %err, "error storing resolved episode");
        }

        self.notifier.send_success(&render_changes_html(changes)).await;

        summary
    }

    /// One chat call seeded with the job context plus each file's
    /// original/fixed pair. A transport failure yields "".
    async fn generate_summary(&self, context: &FailureContext, changes: &[CodeChange]) -> String {
        let body = format!(
            "{}{}",
            render_job_header(context),
            render_changes_context(changes)
        );
        let messages = vec![
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(serde_json::to_string(&body).unwrap_or(body)),
        ];

        match self.ai.complete(&messages).await {
            Ok(summary) => summary.trim().to_string(),
            Err(err) => {
                tracing::error!(error = %err, "error generating resolution summary");
                String::new()
            }
        }
    }
}

fn render_job_header(context: &FailureContext) -> String {
    format!(
        "\n==================\nJOB METADATA\n==================\nName: {}\nData: {}\nID: {}\n\n==================\nSTACKTRACE\n==================\n{}\n",
        context.job.name, context.job.data, context.job.id, context.stacktrace
    )
}

fn render_changes_context(changes: &[CodeChange]) -> String {
    let mut out = String::new();
    for (i, change) in changes.iter().enumerate() {
        out.push_str(&format!(
            "FILE {n}: {path}\nORIGINAL CODE IN FILE {n}:\n```\n{original}\n```\n\nFIXED CODE IN FILE {n}:\n```\n{fixed}\n```\n",
            n = i + 1,
            path = change.path,
            original = change.original_code,
            fixed = change.code
        ));
    }
    out
}
