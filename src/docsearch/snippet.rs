//! Snippet splitting for document indexing.
//!
//! Paragraphs (blank-line delimited) are greedily packed up to a target
//! size. A paragraph exceeding the target alone is split at the first
//! sentence/line boundary past half the target; with no boundary in reach it
//! is hard-split at the target. Empty chunks are discarded.

/// Default target snippet size in characters.
pub const DEFAULT_SNIPPET_TARGET: usize = 1200;

/// Split `text` into snippets around `target` characters.
pub fn split_snippets(text: &str, target: usize) -> Vec<String> {
    let target = target.max(1);
    let mut snippets = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs(text) {
        if paragraph.len() > target {
            flush(&mut current, &mut snippets);
            split_oversized(&paragraph, target, &mut snippets);
            continue;
        }

        if !current.is_empty() && current.len() + 2 + paragraph.len() > target {
            flush(&mut current, &mut snippets);
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&paragraph);
    }

    flush(&mut current, &mut snippets);
    snippets
}

/// Blank-line delimited paragraphs, trimmed, empties dropped.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                out.push(current.trim().to_string());
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn flush(current: &mut String, out: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    current.clear();
}

fn split_oversized(paragraph: &str, target: usize, out: &mut Vec<String>) {
    let mut rest = paragraph;
    while rest.len() > target {
        let half = target / 2;
        let split_at = boundary_after(rest, half).unwrap_or_else(|| hard_boundary(rest, target));
        let (head, tail) = rest.split_at(split_at);
        let head = head.trim();
        if !head.is_empty() {
            out.push(head.to_string());
        }
        rest = tail.trim_start();
    }
    let rest = rest.trim();
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
}

/// First sentence or line boundary ending at or past `from`. Returns the
/// byte index just after the boundary character.
fn boundary_after(s: &str, from: usize) -> Option<usize> {
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let end = i + c.len_utf8();
        if end < from {
            continue;
        }
        match c {
            '\n' => return Some(end),
            '.' | '!' | '?' => {
                let next = chars.peek().map(|(_, n)| *n);
                if next.map_or(true, |n| n.is_whitespace()) {
                    return Some(end);
                }
            }
            _ => {}
        }
    }
    None
}

/// Largest char boundary at or below `target`.
fn hard_boundary(s: &str, target: usize) -> usize {
    let mut idx = target.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        s.len()
    } else {
        idx
    }
}
