//! Deterministic content splitting.
//!
//! Divides file content into pieces suitable for content-addressed chunking.
//! Identical input with identical settings always yields identical piece
//! boundaries; that determinism is what makes content addressing effective
//! across edits and devices. Concatenating the pieces always reproduces the
//! input exactly.

use crate::config::VaultSettings;

/// Splitting policy for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Paragraph/line-aware splitting for markdown, text and canvas files.
    PlainText,
    /// Adaptive fixed-size splitting with delimiter search for binary or
    /// generic content.
    Binary,
}

/// Content splitter configured from the vault settings.
#[derive(Debug, Clone)]
pub struct ContentSplitter {
    min_piece_size: usize,
    binary_min: usize,
    binary_max: usize,
}

impl ContentSplitter {
    pub fn new(settings: &VaultSettings) -> Self {
        Self {
            min_piece_size: settings.min_chunk_size,
            binary_min: settings.binary_piece_size_min,
            binary_max: settings.binary_piece_size_max,
        }
    }

    /// Split `content` under the given policy.
    pub fn split(&self, content: &str, mode: SplitMode) -> Vec<String> {
        match mode {
            SplitMode::PlainText => split_plain_text(content, self.min_piece_size),
            SplitMode::Binary => split_binary(content, self.binary_min, self.binary_max),
        }
    }
}

/// Split plain text on paragraph and line boundaries.
///
/// A piece only closes once it reached `min_piece_size` and sits at a
/// natural boundary: a blank line, the line before a heading, the end of a
/// fenced code block, or end of input. Fenced code blocks are never split
/// internally. Small localized edits therefore only invalidate the pieces
/// touching the edit.
pub fn split_plain_text(content: &str, min_piece_size: usize) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }

    let mut pieces = Vec::new();
    let mut buf = String::new();
    let mut in_fence = false;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let is_fence_marker = trimmed.starts_with("```");

        // A heading opens a new section: close the running piece before it.
        if !in_fence && trimmed.starts_with('#') && buf.len() >= min_piece_size {
            pieces.push(std::mem::take(&mut buf));
        }

        buf.push_str(line);
        if is_fence_marker {
            in_fence = !in_fence;
        }

        let fence_just_closed = is_fence_marker && !in_fence;
        let blank_line = trimmed.is_empty();
        if !in_fence && (blank_line || fence_just_closed) && buf.len() >= min_piece_size {
            pieces.push(std::mem::take(&mut buf));
        }
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

/// Split generic content into adaptively sized pieces.
///
/// The target piece size scales with total length (1/25th) clamped to
/// `[min, max]`, bounding total chunk count for huge files while keeping
/// small files in few pieces. Each cut prefers the last newline within the
/// back half of the target window and falls back to a fixed-size slice when
/// no delimiter occurs there. Content without any delimiter still terminates
/// by pure length-based slicing.
pub fn split_binary(content: &str, min: usize, max: usize) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }

    let target = (content.len() / 25).clamp(min.max(1), max.max(1));
    let mut pieces = Vec::new();
    let mut pos = 0;

    while pos < content.len() {
        let remaining = content.len() - pos;
        if remaining <= target {
            pieces.push(content[pos..].to_string());
            break;
        }

        let mut cut = floor_char_boundary(content, pos + target);
        // Prefer a newline in the back half of the window.
        let search_from = ceil_char_boundary(content, pos + target / 2);
        if search_from < cut {
            if let Some(nl) = content[search_from..cut].rfind('\n') {
                cut = search_from + nl + 1;
            }
        }
        if cut <= pos {
            // Target smaller than one character: advance past the next
            // boundary so the loop always makes progress.
            cut = ceil_char_boundary(content, pos + 1);
        }
        pieces.push(content[pos..cut].to_string());
        pos = cut;
    }

    pieces
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index += 1;
    }
    index
}
