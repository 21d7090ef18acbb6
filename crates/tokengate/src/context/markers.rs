//! Long-term memory marker detection.
//!
//! Messages that carry recalled memory are accounted separately from
//! ordinary chat so observers can see how much of the budget memory
//! injection consumes. Detection is a small closed set of matchers evaluated
//! in a fixed order; the first match wins.

use serde::{Deserialize, Serialize};

/// Opening tags recognized by [`MemoryMarkerKind::InlineTag`].
const INLINE_TAGS: &[&str] = &["<memory>", "<memory ", "<memories>", "<long_term_memory>"];

/// Line prefixes recognized by [`MemoryMarkerKind::BracketBlock`].
const BRACKET_PREFIXES: &[&str] = &[
    "[memory]",
    "[memory:",
    "[[memory]]",
    "[long-term memory]",
    "[recalled memory]",
];

/// Call sites recognized by [`MemoryMarkerKind::FunctionCall`].
const FUNCTION_CALLS: &[&str] = &[
    "save_memory(",
    "recall_memory(",
    "memory.recall(",
    "memory.store(",
    "memory.search(",
];

/// The kinds of memory marker the accountant recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMarkerKind {
    /// An XML-style tag such as `<memory>…</memory>`.
    InlineTag,
    /// A line opening with a bracketed label such as `[memory]`.
    BracketBlock,
    /// A memory tool invocation such as `recall_memory(...)`.
    FunctionCall,
}

impl MemoryMarkerKind {
    /// Evaluation order.
    pub const ALL: [MemoryMarkerKind; 3] = [
        MemoryMarkerKind::InlineTag,
        MemoryMarkerKind::BracketBlock,
        MemoryMarkerKind::FunctionCall,
    ];

    /// Whether `lowered` (already ASCII-lowercased) carries this marker.
    fn matches_lowered(self, lowered: &str) -> bool {
        match self {
            MemoryMarkerKind::InlineTag => INLINE_TAGS.iter().any(|t| lowered.contains(t)),
            MemoryMarkerKind::BracketBlock => lowered.lines().any(|line| {
                let line = line.trim_start();
                BRACKET_PREFIXES.iter().any(|p| line.starts_with(p))
            }),
            MemoryMarkerKind::FunctionCall => FUNCTION_CALLS.iter().any(|c| lowered.contains(c)),
        }
    }

    /// Whether `text` carries this marker.
    pub fn matches(self, text: &str) -> bool {
        self.matches_lowered(&text.to_ascii_lowercase())
    }
}

/// Return the first marker kind found in `text`, if any.
pub fn detect(text: &str) -> Option<MemoryMarkerKind> {
    let lowered = text.to_ascii_lowercase();
    MemoryMarkerKind::ALL
        .into_iter()
        .find(|kind| kind.matches_lowered(&lowered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_tag_detected() {
        assert_eq!(
            detect("context: <memory>user prefers tabs</memory>"),
            Some(MemoryMarkerKind::InlineTag)
        );
        assert_eq!(
            detect("<MEMORY type=\"fact\">x</MEMORY>"),
            Some(MemoryMarkerKind::InlineTag)
        );
    }

    #[test]
    fn bracket_block_must_open_a_line() {
        assert_eq!(
            detect("notes\n  [Memory] project uses tokio"),
            Some(MemoryMarkerKind::BracketBlock)
        );
        assert_eq!(detect("see the [memory] section"), None);
    }

    #[test]
    fn function_call_detected() {
        assert_eq!(
            detect("calling recall_memory(\"deploy steps\")"),
            Some(MemoryMarkerKind::FunctionCall)
        );
    }

    #[test]
    fn fixed_evaluation_order() {
        let text = "<memory>a</memory>\n[memory] b\nsave_memory(c)";
        assert_eq!(detect(text), Some(MemoryMarkerKind::InlineTag));
        assert!(MemoryMarkerKind::BracketBlock.matches(text));
    }

    #[test]
    fn plain_text_has_no_marker() {
        assert_eq!(detect("Please remember to run the tests."), None);
    }
}
