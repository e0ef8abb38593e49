// repair-pipeline-rs/src/synthesis.rs
// Fix synthesis: prompt assembly, best-effort parsing of the model's
// semi-structured response, and concurrent capture of each changed
// file's current content.

use std::path::{Path, PathBuf};

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;

use ai_client::ChatMessage;
use shared_types_rs::CodeChange;

/// System instructions for the fix model. The response format contract
/// (file-path marker, raw code, FIX comments) is what `parse_code_changes`
/// is built to read back.
pub const FIX_SYSTEM_PROMPT: &str = r#"You are a senior software engineer.
Your task is to **REWRITE** the provided code to resolve the job failure.

**READ PREVIOUS RESOLUTION SUMMARIES IF AVAILABLE:**
	 -- You must ALWAYS read the PREVIOUS SIMILAR JOB RESOLUTION SUMMARY if AVAILABLE and TRY to solve the error with that information.
	 -- If the resolution summary is non-similar or incomprehensible, ignore it.

STRICT OUTPUT RULES:
1. **ACTUAL CODE CHANGES:** You must **modify the code logic** to fix the bug. Do not just comment on the error.
   - If the code throws an intentional error that causes failure, **remove or handle it**.
   - The code you output must be the **working, fixed version**.

2. **FORMAT:**
   - **File Path First:** Line 1 must be `// File: <path/to/file.ts>`
   - **No Markdown/Text:** Output *only* the raw code.
   - **Indentation:** Use 4 spaces (no tabs).

3. **COMMENTING STRATEGY:**
   - **Do not** leave the old buggy code commented out. Delete it.
   - Add a comment **only on the specific line you changed** using this format:
     `// FIX: <brief explanation of the change>`"#;

/// File-path marker announcing one changed file in the response.
const FILE_MARKER: &str = "// File:";

/// Opening code fence the model sometimes emits despite the no-markdown
/// rule; matched against the JSON-escaped text, so newlines are the
/// two-character `\n` sequence.
static OPENING_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```\w*(?:\\n)+").expect("fence regex is valid"));

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("no root directory configured; cannot resolve fix paths")]
    RootDirUnset,

    #[error("failed to read original file {path}: {source}")]
    ReadOriginal {
        path: String,
        source: std::io::Error,
    },
}

/// One parsed (path, code) pair before the original content is captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChange {
    pub path: String,
    pub code: String,
}

/// Assemble the chat messages for one fix attempt. The user content is
/// JSON-stringified wholesale, matching what the parser expects to read
/// back out of the model's echoing of it.
pub fn build_fix_messages(prompt: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(FIX_SYSTEM_PROMPT),
        ChatMessage::user(serde_json::to_string(prompt).unwrap_or_else(|_| prompt.to_string())),
    ]
}

/// Prepend the precedent block when consensus produced a winner.
pub fn prepend_precedent(prompt: &str, winner_id: i64, summary: &str) -> String {
    format!(
        "\n===================================================\nPREVIOUS SIMILAR JOB RESOLUTION SUMMARY (JOB {})\n===================================================\n\t{}\n\n{}",
        winner_id, summary, prompt
    )
}

/// Best-effort extraction of (file-path, code) pairs from a model
/// response.
///
/// The response is re-serialized to a JSON string first, so embedded
/// newlines/tabs/quotes appear as two-character escape sequences; the
/// capture logic is tolerant of that escaping, of stray code fences and
/// of a trailing quote artifact. Zero matches is a valid outcome, not an
/// error.
pub fn parse_code_changes(response: &str) -> Vec<ParsedChange> {
    let escaped =
        serde_json::to_string(response).unwrap_or_else(|_| response.to_string());

    let mut changes = Vec::new();
    let mut sections = escaped.split(FILE_MARKER);
    // Anything before the first marker is not a change.
    sections.next();

    for section in sections {
        let Some(path_end) = section.find("\\n") else {
            tracing::warn!("file marker without code block; skipping ambiguous match");
            continue;
        };

        let path = section[..path_end].trim().to_string();
        if path.is_empty() {
            tracing::warn!("file marker with empty path; skipping ambiguous match");
            continue;
        }

        let mut code = &section[path_end..];
        while let Some(rest) = code.strip_prefix("\\n") {
            code = rest;
        }

        // Tolerate an opening fence despite the no-markdown instruction.
        if let Some(m) = OPENING_FENCE_RE.find(code) {
            code = &code[m.end()..];
        }
        // A closing fence ends the block; the next marker already split
        // the sections.
        if let Some(fence) = code.find("```") {
            code = &code[..fence];
        }

        let clean = strip_trailing_quote(&unescape_code(code)).trim().to_string();
        if clean.is_empty() {
            tracing::warn!(path = %path, "file marker with empty code; skipping ambiguous match");
            continue;
        }

        changes.push(ParsedChange { path, code: clean });
    }

    changes
}

/// Undo the JSON escaping for the sequences that matter inside code:
/// `\n`, `\t` and `\"`. Other escapes pass through untouched.
fn unescape_code(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('n') => {
                    out.push('\n');
                    chars.next();
                }
                Some('t') => {
                    out.push('\t');
                    chars.next();
                }
                Some('"') => {
                    out.push('"');
                    chars.next();
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Drop the single stray quote the JSON stringification leaves on the
/// final block.
fn strip_trailing_quote(code: &str) -> &str {
    code.strip_suffix('"').unwrap_or(code)
}

/// Resolve a model-reported path against the application root. Paths are
/// echoed back absolute from the prompt; stripping the root yields the
/// on-disk relative path.
fn resolve_on_disk(root_dir: &Path, path: &str) -> PathBuf {
    let root_str = root_dir.to_string_lossy();
    let rel = path.strip_prefix(root_str.as_ref()).unwrap_or(path);
    let rel = rel.trim_start_matches('/');
    root_dir.join(rel)
}

/// Read every changed file's current content as `original_code`,
/// concurrently, preserving the input order in the output.
pub async fn capture_originals(
    root_dir: Option<&Path>,
    parsed: Vec<ParsedChange>,
) -> Result<Vec<CodeChange>, SynthesisError> {
    let root_dir = root_dir.ok_or(SynthesisError::RootDirUnset)?;

    let reads = parsed.iter().map(|change| {
        let on_disk = resolve_on_disk(root_dir, &change.path);
        async move { tokio::fs::read_to_string(on_disk).await }
    });
    let contents = join_all(reads).await;

    parsed
        .into_iter()
        .zip(contents)
        .map(|(change, content)| match content {
            Ok(original_code) => Ok(CodeChange {
                path: change.path,
                original_code,
                code: change.code,
            }),
            Err(source) => Err(SynthesisError::ReadOriginal {
                path: change.path,
                source,
            }),
        })
        .collect()
}
