//! Textual patches between two versions of a document.
//!
//! The chain policy and the reconstruction engine only see the [`Patcher`]
//! trait, so the diff algorithm can be swapped without touching either.
//! [`UnifiedPatcher`] produces line-based unified diffs via `similar` and
//! applies them strictly: hunk headers must agree with their bodies, and every
//! context and removed line must match the base exactly, or the patch is
//! rejected.

use crate::error::{HistoryError, Result};
use similar::{ChangeTag, DiffTag, TextDiff};

/// Context lines around each hunk.
pub const DEFAULT_CONTEXT_LINES: usize = 3;

/// Creates and applies textual patches.
pub trait Patcher: Send + Sync {
    /// Patch turning `old` into `new`. `id` labels the patch header.
    fn create_patch(&self, old: &str, new: &str, id: &str) -> String;

    /// Apply a patch produced by [`Patcher::create_patch`].
    ///
    /// Fails with `StateConsistency` when the base does not match what the
    /// patch expects.
    fn apply_patch(&self, base: &str, patch: &str) -> Result<String>;

    /// Stored size of a patch, used by the chain policy.
    fn patch_size(&self, patch: &str) -> usize {
        patch.len()
    }
}

/// Line-based unified diff patcher.
#[derive(Clone, Debug)]
pub struct UnifiedPatcher {
    context_lines: usize,
}

impl Default for UnifiedPatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_LINES)
    }
}

impl UnifiedPatcher {
    pub fn new(context_lines: usize) -> Self {
        Self { context_lines }
    }
}

impl Patcher for UnifiedPatcher {
    fn create_patch(&self, old: &str, new: &str, id: &str) -> String {
        let old_lines = split_lines(old);
        let new_lines = split_lines(new);
        let diff = TextDiff::configure().diff_slices(&old_lines, &new_lines);

        let mut out = String::new();
        for group in diff.grouped_ops(self.context_lines) {
            let Some(first) = group.first() else {
                continue;
            };
            if group.iter().all(|op| op.tag() == DiffTag::Equal) {
                continue;
            }

            let mut body = String::new();
            let (mut old_len, mut new_len) = (0usize, 0usize);
            for op in &group {
                for change in diff.iter_changes(op) {
                    let tag = match change.tag() {
                        ChangeTag::Equal => {
                            old_len += 1;
                            new_len += 1;
                            ' '
                        }
                        ChangeTag::Delete => {
                            old_len += 1;
                            '-'
                        }
                        ChangeTag::Insert => {
                            new_len += 1;
                            '+'
                        }
                    };
                    push_line(&mut body, tag, change.value());
                }
            }

            if out.is_empty() {
                out.push_str(&format!("--- {id}\n+++ {id}\n"));
            }
            // Counts come from the body so header and hunk always agree.
            out.push_str(&format!(
                "@@ -{} +{} @@\n",
                format_range(first.old_range().start, old_len),
                format_range(first.new_range().start, new_len)
            ));
            out.push_str(&body);
        }
        out
    }

    fn apply_patch(&self, base: &str, patch: &str) -> Result<String> {
        let hunks = parse_hunks(patch)?;
        let base_lines = split_lines(base);
        let mut out = String::with_capacity(base.len() + patch.len());
        let mut cursor = 0usize;

        for (n, hunk) in hunks.iter().enumerate() {
            let old_len = hunk.old_lines.len();
            let pos = if old_len == 0 {
                hunk.old_start
            } else {
                hunk.old_start.checked_sub(1).ok_or_else(|| {
                    HistoryError::StateConsistency(format!("hunk {n} starts at line 0"))
                })?
            };

            if pos < cursor || pos + old_len > base_lines.len() {
                return Err(HistoryError::StateConsistency(format!(
                    "hunk {} targets lines {}..{} but base has {} lines",
                    n,
                    pos + 1,
                    pos + old_len,
                    base_lines.len()
                )));
            }

            for line in &base_lines[cursor..pos] {
                out.push_str(line);
            }

            let target = &base_lines[pos..pos + old_len];
            for (offset, (expected, actual)) in hunk.old_lines.iter().zip(target).enumerate() {
                if expected != actual {
                    return Err(HistoryError::StateConsistency(format!(
                        "content mismatch at line {}: expected {:?}, found {:?}",
                        pos + offset + 1,
                        expected,
                        actual
                    )));
                }
            }

            for line in &hunk.new_lines {
                out.push_str(line);
            }
            cursor = pos + old_len;
        }

        for line in &base_lines[cursor..] {
            out.push_str(line);
        }

        Ok(out)
    }
}

/// Lines of a document, each keeping its `\n`. Only `\n` ends a line, so a
/// lone `\r` stays part of the line it appears in.
fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn push_line(out: &mut String, tag: char, line: &str) {
    out.push(tag);
    out.push_str(line);
    if !line.ends_with('\n') {
        out.push_str(NO_NEWLINE_MARKER);
    }
}

const NO_NEWLINE_MARKER: &str = "\n\\ No newline at end of file\n";

fn format_range(start: usize, len: usize) -> String {
    if len == 0 {
        format!("{start},0")
    } else {
        format!("{},{}", start + 1, len)
    }
}

/// One parsed hunk.
#[derive(Debug, Default)]
struct Hunk {
    old_start: usize,
    old_len: usize,
    new_len: usize,
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

fn parse_hunks(patch: &str) -> Result<Vec<Hunk>> {
    let mut hunks = Vec::new();
    let mut lines = patch.split_inclusive('\n').peekable();

    // File headers and anything else before the first hunk.
    while lines.peek().is_some_and(|line| !line.starts_with("@@")) {
        lines.next();
    }

    while let Some(header) = lines.next() {
        let mut hunk = parse_hunk_header(header)?;

        // The body runs to the next header or the end of the patch.
        while let Some(body) = lines.next_if(|line| !line.starts_with("@@")) {
            let (tag, rest) = if body == "\n" {
                (' ', body)
            } else {
                let mut chars = body.chars();
                let tag = chars.next().unwrap_or(' ');
                (tag, chars.as_str())
            };
            let mut text = rest.to_string();
            if lines.peek().is_some_and(|next| next.starts_with('\\')) {
                lines.next();
                if text.ends_with('\n') {
                    text.pop();
                }
            }

            match tag {
                ' ' => {
                    hunk.old_lines.push(text.clone());
                    hunk.new_lines.push(text);
                }
                '-' => hunk.old_lines.push(text),
                '+' => hunk.new_lines.push(text),
                _ => {
                    return Err(HistoryError::StateConsistency(format!(
                        "unexpected hunk line {:?}",
                        body
                    )))
                }
            }
        }

        if hunk.old_lines.len() != hunk.old_len || hunk.new_lines.len() != hunk.new_len {
            return Err(HistoryError::StateConsistency(format!(
                "hunk {:?} declares -{} +{} lines but carries -{} +{}",
                header.trim_end(),
                hunk.old_len,
                hunk.new_len,
                hunk.old_lines.len(),
                hunk.new_lines.len()
            )));
        }
        hunks.push(hunk);
    }

    Ok(hunks)
}

fn parse_hunk_header(line: &str) -> Result<Hunk> {
    let malformed = || HistoryError::StateConsistency(format!("malformed hunk header {:?}", line));

    let mut parts = line.trim_start_matches('@').split_whitespace();
    let old = parts
        .next()
        .and_then(|s| s.strip_prefix('-'))
        .ok_or_else(malformed)?;
    let new = parts
        .next()
        .and_then(|s| s.strip_prefix('+'))
        .ok_or_else(malformed)?;

    let (old_start, old_len) = parse_range(old).ok_or_else(malformed)?;
    let (_, new_len) = parse_range(new).ok_or_else(malformed)?;

    Ok(Hunk {
        old_start,
        old_len,
        new_len,
        ..Default::default()
    })
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
