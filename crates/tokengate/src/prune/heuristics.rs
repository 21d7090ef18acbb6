//! Local line scoring: source detection, structural protection, and goal
//! relevance.

use std::collections::HashSet;

use super::types::SourceType;

/// Score of a blank line.
pub const BLANK_SCORE: f32 = 0.0;
/// Score of a line repeating an earlier one.
pub const DUPLICATE_SCORE: f32 = 0.05;
/// Score of an ordinary line when there is no goal hint to compare against.
pub const NEUTRAL_SCORE: f32 = 0.5;

const CODE_STRUCTURAL: &[&str] = &[
    "import ",
    "from ",
    "use ",
    "pub use ",
    "#include",
    "package ",
    "require(",
    "fn ",
    "pub fn ",
    "pub(crate) fn ",
    "async fn ",
    "pub async fn ",
    "def ",
    "async def ",
    "class ",
    "struct ",
    "pub struct ",
    "enum ",
    "pub enum ",
    "trait ",
    "pub trait ",
    "impl ",
    "impl<",
    "interface ",
    "type ",
    "pub type ",
    "func ",
    "function ",
    "export ",
    "mod ",
    "pub mod ",
    "@",
];

const LOG_STRUCTURAL: &[&str] = &[
    "error",
    "exception",
    "traceback",
    "panicked",
    "panic:",
    "fatal",
    "failed",
    "caused by",
    "stack backtrace",
];

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "are", "was", "why", "how", "what",
    "does", "not", "fix",
];

/// Pick a concrete source type for `lines` by counting telltale lines.
pub fn detect_source(lines: &[&str]) -> SourceType {
    let mut code = 0usize;
    let mut log = 0usize;
    let mut doc = 0usize;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if looks_like_log(trimmed) {
            log += 1;
        } else if looks_like_code(trimmed) {
            code += 1;
        } else if is_heading(trimmed) || trimmed.starts_with("- ") || trimmed.starts_with("* ") {
            doc += 1;
        }
    }
    if log > 0 && log >= code && log >= doc {
        SourceType::Log
    } else if code > 0 && code >= doc {
        SourceType::Code
    } else {
        SourceType::Document
    }
}

fn looks_like_log(trimmed: &str) -> bool {
    let starts_with_timestamp = trimmed.len() >= 10
        && trimmed.chars().take(4).all(|c| c.is_ascii_digit())
        && trimmed.chars().nth(4) == Some('-');
    if starts_with_timestamp {
        return true;
    }
    let head: String = trimmed.chars().take(24).collect::<String>().to_ascii_lowercase();
    LOG_LEVELS.iter().any(|level| {
        head.starts_with(&format!("[{level}"))
            || head.starts_with(&format!("{level}:"))
            || head.contains(&format!(" {level} "))
    })
}

fn looks_like_code(trimmed: &str) -> bool {
    trimmed.ends_with('{')
        || trimmed.ends_with(';')
        || trimmed == "}"
        || trimmed.starts_with("//")
        || CODE_STRUCTURAL.iter().any(|p| trimmed.starts_with(p))
}

fn is_heading(trimmed: &str) -> bool {
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes) && trimmed.chars().nth(hashes) == Some(' ')
}

fn is_underline(trimmed: &str) -> bool {
    trimmed.len() >= 3 && (trimmed.chars().all(|c| c == '=') || trimmed.chars().all(|c| c == '-'))
}

/// Whether a line must survive pruning for the given (resolved) source type.
pub fn is_structural(line: &str, source: SourceType) -> bool {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return false;
    }
    match source {
        SourceType::Code => CODE_STRUCTURAL.iter().any(|p| trimmed.starts_with(p)),
        SourceType::Log => {
            let lowered = trimmed.to_ascii_lowercase();
            LOG_STRUCTURAL.iter().any(|k| lowered.contains(k)) || lowered.starts_with("file \"")
        }
        SourceType::Document => is_heading(trimmed) || is_underline(trimmed.trim_end()),
        SourceType::Auto => false,
    }
}

/// Lowercased terms of at least three characters, minus stopwords.
pub fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Relevance of a line to the goal, in `[0.1, 1.0]`.
///
/// The fraction of goal terms the line mentions, lifted off zero so an
/// unrelated line still outranks a blank or repeated one.
pub fn relevance(line: &str, goal_terms: &HashSet<String>) -> f32 {
    if goal_terms.is_empty() {
        return NEUTRAL_SCORE;
    }
    let line_terms = terms(line);
    let hits = goal_terms
        .iter()
        .filter(|t| line_terms.contains(*t))
        .count();
    0.1 + 0.9 * hits as f32 / goal_terms.len() as f32
}

/// Per-line classification before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Never pruned.
    Protected,
    Blank,
    /// Repeats an earlier non-blank line.
    Duplicate,
    Ordinary,
}

/// Classify every line. First and last lines are anchored.
pub fn classify(lines: &[&str], source: SourceType) -> Vec<LineClass> {
    let last = lines.len().saturating_sub(1);
    let mut seen: HashSet<&str> = HashSet::new();
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let trimmed = line.trim();
            if i == 0 || i == last || is_structural(line, source) {
                if !trimmed.is_empty() {
                    seen.insert(trimmed);
                }
                LineClass::Protected
            } else if trimmed.is_empty() {
                LineClass::Blank
            } else if !seen.insert(trimmed) {
                LineClass::Duplicate
            } else {
                LineClass::Ordinary
            }
        })
        .collect()
}
