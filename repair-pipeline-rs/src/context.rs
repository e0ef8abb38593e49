// repair-pipeline-rs/src/context.rs
// Failure-context extraction: stack-frame parsing, error-signature
// normalization, focused snippets and full-file code context.
//
// Extraction never fails. Unreadable files degrade to inline error
// markers; a trace with no parseable frames still yields a context with
// the error signature and job metadata.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use shared_types_rs::{
    ErrorSignature, FailureContext, FailureEvent, FailureLocation, FocusedSnippet, JobSummary,
};

/// Lines of context on each side of a failure line.
const SNIPPET_CONTEXT_LINES: u32 = 12;

/// How many failure locations get a focused snippet.
const MAX_SNIPPET_LOCATIONS: usize = 3;

/// Frames under these directories are library code, excluded from both
/// locations and full-file reading.
const DEPENDENCY_DIRS: &[&str] = &["/node_modules/"];

static STACK_FRAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"at\s+(?:(?P<func>[^\s(]+)\s+)?\(?(?P<file>(?:[A-Za-z]:\\|/)?[^():\n]+\.(?:js|ts|mjs|cjs)):(?P<line>\d+):(?P<col>\d+)\)?",
    )
    .expect("stack frame regex is valid")
});

static ERROR_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?P<type>[A-Z][a-zA-Z]*Error):\s*(?P<message>.+)$")
        .expect("error type regex is valid")
});

static JOB_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)job\s+\d+").expect("job id regex is valid"));

static TIMESTAMP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{13,}").expect("timestamp regex is valid"));

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}\b")
        .expect("uuid regex is valid")
});

static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+\b").expect("number regex is valid"));

/// Normalize an error message into a stable signature. The substitution
/// order is load-bearing: the broader patterns must not consume tokens
/// the narrower ones are meant to label.
pub fn normalize_error_message(message: &str) -> String {
    let message = JOB_ID_RE.replace_all(message, "job <ID>");
    let message = TIMESTAMP_RE.replace_all(&message, "<TIMESTAMP>");
    let message = UUID_RE.replace_all(&message, "<UUID>");
    let message = NUMBER_RE.replace_all(&message, "<N>");
    message.trim().to_string()
}

/// Match the `<Type>Error: message` head of a trace, falling back to the
/// queue-supplied failure reason.
pub fn extract_error_signature(stacktrace: &str, failed_reason: Option<&str>) -> ErrorSignature {
    let (error_type, error_message) = match ERROR_TYPE_RE.captures(stacktrace) {
        Some(caps) => (
            caps.name("type").map(|m| m.as_str()).unwrap_or("Error").to_string(),
            caps.name("message").map(|m| m.as_str()).unwrap_or("").to_string(),
        ),
        None => (
            "Error".to_string(),
            failed_reason.unwrap_or("Unknown failure").to_string(),
        ),
    };

    let normalized = normalize_error_message(&error_message);
    ErrorSignature {
        normalized_signature: format!("{}: {}", error_type, normalized),
        error_type,
        error_message,
    }
}

fn is_dependency_frame(file_path: &str) -> bool {
    DEPENDENCY_DIRS.iter().any(|dir| file_path.contains(dir))
}

/// Parse unique application-code frames out of a stack trace, in trace
/// order (most recent first). Deduplicated by (file, line).
pub fn extract_failure_locations(stacktrace: &str) -> Vec<FailureLocation> {
    let mut seen: HashSet<(String, u32)> = HashSet::new();
    let mut locations = Vec::new();

    for caps in STACK_FRAME_RE.captures_iter(stacktrace) {
        let file_path = match caps.name("file") {
            Some(m) => m.as_str().to_string(),
            None => continue,
        };
        if is_dependency_frame(&file_path) {
            continue;
        }

        let line_number: u32 = match caps.name("line").and_then(|m| m.as_str().parse().ok()) {
            Some(n) => n,
            None => continue,
        };
        let column_number: u32 = caps
            .name("col")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);

        if !seen.insert((file_path.clone(), line_number)) {
            continue;
        }

        locations.push(FailureLocation {
            file_path,
            line_number,
            column_number,
            function_name: caps.name("func").map(|m| m.as_str().to_string()),
        });
    }

    locations
}

/// Build a numbered snippet window around one failure line, clamped to
/// the file bounds. The failure line is marked with `>>>`.
pub fn build_focused_snippet(
    file_path: &str,
    contents: &str,
    failure_line: u32,
) -> Option<FocusedSnippet> {
    let lines: Vec<&str> = contents.lines().collect();
    let total = lines.len() as u32;
    if total == 0 || failure_line == 0 || failure_line > total {
        return None;
    }

    let start_line = failure_line.saturating_sub(SNIPPET_CONTEXT_LINES).max(1);
    let end_line = (failure_line + SNIPPET_CONTEXT_LINES).min(total);

    let mut content = String::new();
    for line_num in start_line..=end_line {
        let marker = if line_num == failure_line { ">>>" } else { "   " };
        let text = lines[(line_num - 1) as usize];
        content.push_str(&format!("{} {:>4}: {}\n", marker, line_num, text));
    }

    Some(FocusedSnippet {
        file_path: file_path.to_string(),
        start_line,
        end_line,
        failure_line,
        content: content.trim_end().to_string(),
    })
}

/// Extract the full structured context for one failure event.
pub async fn extract(event: &FailureEvent) -> FailureContext {
    let stacktrace = event.latest_stacktrace().to_string();
    let error_signature =
        extract_error_signature(&stacktrace, event.failed_reason.as_deref());
    let failure_locations = extract_failure_locations(&stacktrace);

    let mut focused_snippets = Vec::new();
    for loc in failure_locations.iter().take(MAX_SNIPPET_LOCATIONS) {
        match tokio::fs::read_to_string(&loc.file_path).await {
            Ok(contents) => {
                if let Some(snippet) =
                    build_focused_snippet(&loc.file_path, &contents, loc.line_number)
                {
                    focused_snippets.push(snippet);
                }
            }
            Err(err) => {
                tracing::debug!(file = %loc.file_path, error = %err, "snippet source unreadable");
            }
        }
    }

    // Unique referenced files, in trace order, plus the job's declared
    // entry file.
    let mut file_paths: Vec<String> = Vec::new();
    for loc in &failure_locations {
        if !file_paths.contains(&loc.file_path) {
            file_paths.push(loc.file_path.clone());
        }
    }
    if let Some(entry) = event.entry_file() {
        if !file_paths.iter().any(|p| p == entry) {
            file_paths.push(entry.to_string());
        }
    }

    let mut code_context = String::new();
    for (i, path) in file_paths.iter().enumerate() {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => {
                code_context.push_str(&format!(
                    "FILE {n}: {path}\nCODE IN FILE {n}:\n```\n{data}\n```\n\n",
                    n = i + 1,
                    path = path,
                    data = data
                ));
            }
            Err(err) => {
                code_context.push_str(&format!(
                    "FILE {n}: {path}\nERROR: Could not read file ({err})\n\n",
                    n = i + 1,
                    path = path,
                    err = err
                ));
            }
        }
    }

    FailureContext {
        job: JobSummary {
            id: event.id.clone(),
            name: event.name.clone(),
            data: event.data.clone(),
        },
        stacktrace,
        error_signature,
        failure_locations,
        focused_snippets,
        code_context,
    }
}
