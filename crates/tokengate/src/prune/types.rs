//! Wire and record types for the redactor.
//!
//! Everything here is (de)serializable because the same types travel over
//! the JSON-RPC boundary. All line numbers are 1-indexed and inclusive, in
//! the numbering of the original text.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::StageWarning;

/// Kind of text being pruned. Selects which lines count as structural.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Code,
    Log,
    Document,
    /// Detect from content.
    #[default]
    Auto,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Code => write!(f, "code"),
            SourceType::Log => write!(f, "log"),
            SourceType::Document => write!(f, "document"),
            SourceType::Auto => write!(f, "auto"),
        }
    }
}

fn default_max_prune_ratio() -> f64 {
    PruneOptions::default().max_prune_ratio
}

fn default_min_keep_lines() -> usize {
    PruneOptions::default().min_keep_lines
}

fn default_timeout_ms() -> u64 {
    PruneOptions::default().timeout_ms
}

fn default_true() -> bool {
    true
}

/// Per-call pruning options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneOptions {
    /// Upper bound on `pruned_lines / original_lines`.
    #[serde(default = "default_max_prune_ratio")]
    pub max_prune_ratio: f64,
    /// Lower bound on kept lines.
    #[serde(default = "default_min_keep_lines")]
    pub min_keep_lines: usize,
    /// Deadline for the whole call. Zero means already expired.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Prefix kept lines with their original line number.
    #[serde(default)]
    pub annotate_lines: bool,
    /// Insert a one-line marker where each block was removed.
    #[serde(default = "default_true")]
    pub include_markers: bool,
    /// Score lines with the remote reranker when one is configured.
    #[serde(default)]
    pub use_reranker: bool,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            max_prune_ratio: 0.5,
            min_keep_lines: 5,
            timeout_ms: 2_000,
            annotate_lines: false,
            include_markers: true,
            use_reranker: false,
        }
    }
}

impl PruneOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_max_prune_ratio(mut self, ratio: f64) -> Self {
        self.max_prune_ratio = ratio;
        self
    }

    pub fn with_min_keep_lines(mut self, lines: usize) -> Self {
        self.min_keep_lines = lines;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_annotate_lines(mut self, on: bool) -> Self {
        self.annotate_lines = on;
        self
    }

    pub fn with_markers(mut self, on: bool) -> Self {
        self.include_markers = on;
        self
    }

    pub fn with_reranker(mut self, on: bool) -> Self {
        self.use_reranker = on;
        self
    }

    /// Validate ranges. Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if !self.max_prune_ratio.is_finite() || !(0.0..=1.0).contains(&self.max_prune_ratio) {
            return Err(format!(
                "max_prune_ratio must be within [0, 1], got {}",
                self.max_prune_ratio
            ));
        }
        Ok(())
    }
}

/// Input to `prune_text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneRequest {
    pub text: String,
    #[serde(default)]
    pub goal_hint: String,
    #[serde(default)]
    pub source_type: SourceType,
    #[serde(default)]
    pub options: PruneOptions,
}

impl PruneRequest {
    pub fn new(text: impl Into<String>, goal_hint: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            goal_hint: goal_hint.into(),
            source_type: SourceType::Auto,
            options: PruneOptions::default(),
        }
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    pub fn with_options(mut self, options: PruneOptions) -> Self {
        self.options = options;
        self
    }
}

/// Why a block of lines was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    /// Every removed line was blank.
    Blank,
    /// Every removed line was blank or repeated an earlier line.
    Duplicate,
    /// At least one removed line scored low against the goal hint.
    LowRelevance,
}

impl std::fmt::Display for PruneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PruneReason::Blank => write!(f, "blank"),
            PruneReason::Duplicate => write!(f, "duplicate"),
            PruneReason::LowRelevance => write!(f, "low_relevance"),
        }
    }
}

/// One contiguous removed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub start_line: usize,
    pub end_line: usize,
    pub pruned_count: usize,
    pub reason: PruneReason,
    /// Exact text of the marker line inserted at the removal point.
    pub marker: String,
}

/// Counters reported with every prune response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PruneStats {
    pub original_lines: usize,
    pub kept_lines: usize,
    pub pruned_lines: usize,
    pub pruned_ratio: f64,
    /// Source type after auto-detection.
    pub source_type: Option<SourceType>,
    pub reranker_used: bool,
    pub cache_hit: bool,
    pub elapsed_ms: u64,
}

/// Output of `prune_text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneResponse {
    pub prune_id: String,
    pub pruned_text: String,
    pub annotations: Vec<Annotation>,
    pub stats: PruneStats,
    #[serde(default)]
    pub warnings: Vec<StageWarning>,
    /// The input came back unchanged because pruning could not run.
    #[serde(default)]
    pub used_fallback: bool,
}

/// Inclusive, 1-indexed line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start_line: usize,
    pub end_line: usize,
}

impl LineRange {
    pub fn new(start_line: usize, end_line: usize) -> Self {
        Self {
            start_line,
            end_line,
        }
    }

    /// Clamp to `1..=line_count`. `None` when nothing is left.
    pub fn clamp(self, line_count: usize) -> Option<(usize, usize)> {
        let start = self.start_line.max(1);
        let end = self.end_line.min(line_count);
        (line_count > 0 && start <= end).then_some((start, end))
    }
}

/// Input to `recover_text` / `recover_range`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRequest {
    pub prune_id: String,
    /// Empty means the whole original text.
    #[serde(default)]
    pub ranges: Vec<LineRange>,
    #[serde(default)]
    pub include_line_numbers: bool,
}

impl RecoverRequest {
    pub fn all(prune_id: impl Into<String>) -> Self {
        Self {
            prune_id: prune_id.into(),
            ranges: Vec::new(),
            include_line_numbers: false,
        }
    }

    pub fn range(prune_id: impl Into<String>, start_line: usize, end_line: usize) -> Self {
        Self {
            ranges: vec![LineRange::new(start_line, end_line)],
            ..Self::all(prune_id)
        }
    }
}

/// What the store keeps for every issued `prune_id`.
#[derive(Debug, Clone)]
pub struct RedactionRecord {
    pub prune_id: String,
    pub original_lines: Vec<String>,
    pub trailing_newline: bool,
    /// 1-indexed original numbers of the lines that survived.
    pub kept_lines: Vec<usize>,
    pub annotations: Vec<Annotation>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl RedactionRecord {
    pub fn original_line_count(&self) -> usize {
        self.original_lines.len()
    }

    /// Expired once `now >= created_at + ttl`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        match self.created_at.checked_add_signed(ttl) {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// Split text into lines, remembering whether it ended with a newline.
pub fn split_lines(text: &str) -> (Vec<&str>, bool) {
    if text.is_empty() {
        return (Vec::new(), false);
    }
    let trailing = text.ends_with('\n');
    let body = text.strip_suffix('\n').unwrap_or(text);
    (body.split('\n').collect(), trailing)
}

/// Line-number prefix used by `annotate_lines` and `include_line_numbers`.
pub fn line_prefix(line_number: usize, width: usize) -> String {
    format!("{line_number:>width$}| ")
}

/// Prefix width for a text of `line_count` lines.
pub fn prefix_width(line_count: usize) -> usize {
    line_count.to_string().len().max(4)
}
