// shared-types-rs/src/failure.rs
// Failure events as handed over by the job queue, plus the structured
// context the repair pipeline derives from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One job invocation that exhausted its retry budget.
///
/// Produced by the queue collaborator when `attempts_made >= max_attempts`
/// and the job has been moved to the dead-letter queue. Immutable input to
/// the repair pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: String,
    pub name: String,
    pub queue_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Stack traces in queue order, most recent attempt last.
    #[serde(default)]
    pub stacktrace: Vec<String>,
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub attempts_made: u32,
    pub max_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    /// When the job was enqueued.
    pub timestamp: DateTime<Utc>,
}

impl FailureEvent {
    /// The stack trace of the final (most recent) attempt, or "" when the
    /// queue recorded none.
    pub fn latest_stacktrace(&self) -> &str {
        self.stacktrace.last().map(String::as_str).unwrap_or("")
    }

    /// The entry file the job declared in its payload, if any.
    pub fn entry_file(&self) -> Option<&str> {
        self.data.get("callfile").and_then(|v| v.as_str())
    }

    /// Whether the submitter opted this job into automated repair.
    pub fn repair_requested(&self) -> bool {
        self.data
            .get("reasoning_fix")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Normalized error identity used for stable grouping of error classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub error_type: String,
    pub error_message: String,
    pub normalized_signature: String,
}

/// One unique stack frame pointing into application code.
///
/// Frames under dependency directories are excluded before this type is
/// ever constructed; deduplication key is (file_path, line_number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureLocation {
    pub file_path: String,
    pub line_number: u32,
    pub column_number: u32,
    pub function_name: Option<String>,
}

/// A numbered source window around one failure site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusedSnippet {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub failure_line: u32,
    pub content: String,
}

/// The job identity carried into prompts and memory records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
}

/// Structured, bounded description of one failure: signature, ordered
/// locations, focused snippets and the rendered full-file code context.
///
/// Extraction never fails; unreadable files degrade to inline error
/// markers inside `code_context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContext {
    pub job: JobSummary,
    pub stacktrace: String,
    pub error_signature: ErrorSignature,
    pub failure_locations: Vec<FailureLocation>,
    pub focused_snippets: Vec<FocusedSnippet>,
    /// Rendered `FILE n` blocks with full referenced-file contents.
    pub code_context: String,
}

impl FailureContext {
    /// Render the whole context as the prompt body sent to the fix model.
    pub fn render_prompt(&self) -> String {
        let mut out = String::new();

        out.push_str("\n==================\nJOB METADATA\n==================\n");
        out.push_str(&format!(
            "Name: {}\nData: {}\nID: {}\n",
            self.job.name, self.job.data, self.job.id
        ));

        out.push_str("\n==================\nSTACKTRACE\n==================\n");
        out.push_str(&self.stacktrace);
        out.push('\n');

        out.push_str("\n==================\nERROR SIGNATURE\n==================\n");
        out.push_str(&format!(
            "{}: {}\nNormalized: {}\n",
            self.error_signature.error_type,
            self.error_signature.error_message,
            self.error_signature.normalized_signature
        ));

        if !self.failure_locations.is_empty() {
            out.push_str("\n==================\nFAILURE LOCATIONS\n==================\n");
            for loc in &self.failure_locations {
                match &loc.function_name {
                    Some(func) => out.push_str(&format!(
                        "{} ({}:{}:{})\n",
                        func, loc.file_path, loc.line_number, loc.column_number
                    )),
                    None => out.push_str(&format!(
                        "{}:{}:{}\n",
                        loc.file_path, loc.line_number, loc.column_number
                    )),
                }
            }
        }

        if !self.focused_snippets.is_empty() {
            out.push_str("\n==================\nFOCUSED SNIPPETS\n==================\n");
            for snippet in &self.focused_snippets {
                out.push_str(&format!(
                    "{} (lines {}-{}):\n{}\n\n",
                    snippet.file_path, snippet.start_line, snippet.end_line, snippet.content
                ));
            }
        }

        out.push_str("\n==================\nCODE CONTEXT\n==================\n");
        out.push_str(&self.code_context);

        out
    }
}

/// One file's proposed rewrite, with the pre-fix content captured so the
/// sandbox and the notifier can both see the before/after pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChange {
    pub path: String,
    #[serde(rename = "originalCode")]
    pub original_code: String,
    pub code: String,
}
