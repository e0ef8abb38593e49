// notifier-rs/src/diff_html.rs
// Line-level HTML diff rendering for notification payloads.

use shared_types_rs::CodeChange;

const ADDED_STYLE: &str = "background-color: #e6ffec";
const REMOVED_STYLE: &str = "background-color: #ffebe9; text-decoration: line-through";
const UNCHANGED_STYLE: &str = "color: #6a737d";

/// Render an HTML diff between two code strings. Inputs may arrive
/// JSON-stringified (escaped newlines, surrounding quotes); plain strings
/// pass through unchanged.
pub fn render_diff_html(old_code: &str, new_code: &str) -> String {
    let old_text = decode_json_string(old_code);
    let new_text = decode_json_string(new_code);

    let old_lines: Vec<&str> = old_text.lines().collect();
    let new_lines: Vec<&str> = new_text.lines().collect();

    let mut body = String::new();
    for op in diff_lines(&old_lines, &new_lines) {
        let (style, prefix, line) = match op {
            DiffOp::Unchanged(line) => (UNCHANGED_STYLE, "&nbsp;&nbsp;", line),
            DiffOp::Removed(line) => (REMOVED_STYLE, "-&nbsp;", line),
            DiffOp::Added(line) => (ADDED_STYLE, "+&nbsp;", line),
        };
        body.push_str(&format!(
            "<div style=\"{}\">{}{}</div>",
            style,
            prefix,
            escape_html(line)
        ));
    }

    format!(
        "<div style=\"font-family: monospace; white-space: pre-wrap; font-size: 12px;\">{}</div>",
        body
    )
}

/// Render the success-notification body: one path + diff block per change.
pub fn render_changes_html(changes: &[CodeChange]) -> String {
    changes
        .iter()
        .map(|c| {
            format!(
                "<b>Path</b>: {}<br><b>Code</b>: <br><br><code>{}</code><br>",
                escape_html(&c.path),
                render_diff_html(&c.original_code, &c.code)
            )
        })
        .collect::<Vec<_>>()
        .join("<br><br>")
}

fn decode_json_string(raw: &str) -> String {
    serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.to_string())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

enum DiffOp<'a> {
    Unchanged(&'a str),
    Removed(&'a str),
    Added(&'a str),
}

/// Longest-common-subsequence line diff. The payloads here are single
/// files, so the quadratic table is fine.
fn diff_lines<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<DiffOp<'a>> {
    let n = old.len();
    let m = new.len();

    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(DiffOp::Unchanged(old[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push(DiffOp::Removed(old[i]));
            i += 1;
        } else {
            ops.push(DiffOp::Added(new[j]));
            j += 1;
        }
    }
    while i < n {
        ops.push(DiffOp::Removed(old[i]));
        i += 1;
    }
    while j < m {
        ops.push(DiffOp::Added(new[j]));
        j += 1;
    }

    ops
}
