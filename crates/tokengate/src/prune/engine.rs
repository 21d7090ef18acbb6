//! The line-level pruning engine.
//!
//! A prune runs in four steps:
//!
//! 1. **Guard**: validate options, input size, deadline and the
//!    `min_keep_lines` constraint. Any failure fails open.
//! 2. **Classify**: resolve the source type, protect structural lines and
//!    the first/last line, flag blank and repeated lines.
//! 3. **Score**: goal relevance from the local heuristic, or from the
//!    reranker when the caller opted in and it answers in time.
//! 4. **Select**: remove the lowest-scoring lines up to
//!    `min(floor(N * max_prune_ratio), N - min_keep_lines)`, group removed
//!    lines into contiguous blocks, annotate each block and render.
//!
//! Every call, including every fail-open, stores a [`RedactionRecord`] and
//! returns a usable `prune_id`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::heuristics::{self, BLANK_SCORE, DUPLICATE_SCORE, LineClass};
use super::rerank::{CacheStats, RerankCache, RerankKey};
use super::store::{DEFAULT_MAX_RECORDS, DEFAULT_RECORD_TTL, RedactionStore};
use super::types::{
    Annotation, PruneReason, PruneRequest, PruneResponse, PruneStats, RecoverRequest,
    RedactionRecord, SourceType, line_prefix, prefix_width, split_lines,
};
use super::{RedactFuture, Redactor};
use crate::capabilities::Rerank;
use crate::error::Result;
use crate::pipeline::StageWarning;

/// Configuration for the [`Pruner`].
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    /// Inputs larger than this fail open with `input_too_large`.
    pub max_input_bytes: usize,
    /// Inputs with more lines than this fail open with `input_too_large`.
    pub max_input_lines: usize,
    /// Lifetime of each [`RedactionRecord`].
    pub record_ttl: Duration,
    pub max_records: usize,
    /// Lines scoring at or above this are never pruned.
    pub keep_score: f32,
    /// Inputs with more lines than this skip the reranker.
    pub max_rerank_lines: usize,
    /// Upper bound on one reranker call (also capped by the prune deadline).
    pub rerank_timeout: Duration,
    pub rerank_cache_ttl: Duration,
    pub rerank_cache_capacity: usize,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 2 * 1024 * 1024,
            max_input_lines: 50_000,
            record_ttl: DEFAULT_RECORD_TTL,
            max_records: DEFAULT_MAX_RECORDS,
            keep_score: 0.75,
            max_rerank_lines: 2_000,
            rerank_timeout: Duration::from_secs(3),
            rerank_cache_ttl: Duration::from_secs(600),
            rerank_cache_capacity: 256,
        }
    }
}

impl PrunerConfig {
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    pub fn with_input_limits(mut self, max_bytes: usize, max_lines: usize) -> Self {
        self.max_input_bytes = max_bytes;
        self.max_input_lines = max_lines;
        self
    }

    pub fn with_rerank_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.rerank_cache_capacity = capacity;
        self.rerank_cache_ttl = ttl;
        self
    }
}

/// Reasons a prune returns its input unchanged.
#[derive(Debug, Clone, PartialEq)]
enum FailOpen {
    InvalidOptions(String),
    InputTooLarge(String),
    Timeout,
    ConstraintUnsatisfiable { lines: usize, min_keep_lines: usize },
    Internal(String),
}

impl FailOpen {
    fn warning(&self) -> StageWarning {
        match self {
            FailOpen::InvalidOptions(msg) => StageWarning::new("invalid_options", msg.clone()),
            FailOpen::InputTooLarge(msg) => StageWarning::new("input_too_large", msg.clone()),
            FailOpen::Timeout => StageWarning::new("timeout", "prune deadline expired"),
            FailOpen::ConstraintUnsatisfiable {
                lines,
                min_keep_lines,
            } => StageWarning::new(
                "constraint_unsatisfiable",
                format!("{lines} line(s) is fewer than min_keep_lines={min_keep_lines}"),
            ),
            FailOpen::Internal(msg) => StageWarning::new("internal_error", msg.clone()),
        }
    }
}

/// Cap for a timeout too large to add to `Instant::now()`.
const MAX_DEADLINE: Duration = Duration::from_secs(86_400);

/// Cooperative deadline. A zero timeout is already expired.
struct Deadline {
    at: Instant,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            at: now.checked_add(timeout).unwrap_or(now + MAX_DEADLINE),
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    fn check(&self) -> std::result::Result<(), FailOpen> {
        if self.expired() {
            Err(FailOpen::Timeout)
        } else {
            Ok(())
        }
    }
}

/// What the selection step decided.
struct Selection {
    removed: Vec<bool>,
    source: SourceType,
    reranker_used: bool,
    cache_hit: bool,
}

/// Local line-level pruner. Also the backing implementation of the
/// JSON-RPC service.
pub struct Pruner {
    config: PrunerConfig,
    store: Arc<RedactionStore>,
    reranker: Option<Arc<dyn Rerank>>,
    cache: RerankCache,
}

impl std::fmt::Debug for Pruner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reranker = self.reranker.as_ref().map(|r| r.name());
        f.debug_struct("Pruner")
            .field("config", &self.config)
            .field("records", &self.store.len())
            .field("reranker", &reranker)
            .finish()
    }
}

impl Default for Pruner {
    fn default() -> Self {
        Self::new(PrunerConfig::default())
    }
}

impl Pruner {
    pub fn new(config: PrunerConfig) -> Self {
        let store = Arc::new(RedactionStore::new(config.max_records));
        Self::with_store(config, store)
    }

    /// Use an existing record store (shared with other pruners or tests).
    pub fn with_store(config: PrunerConfig, store: Arc<RedactionStore>) -> Self {
        let cache = RerankCache::new(config.rerank_cache_capacity, config.rerank_cache_ttl);
        Self {
            config,
            store,
            reranker: None,
            cache,
        }
    }

    /// Attach a remote reranker (builder pattern).
    pub fn with_reranker(mut self, reranker: Arc<dyn Rerank>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RedactionStore> {
        &self.store
    }

    pub fn reranker_name(&self) -> Option<&str> {
        self.reranker.as_deref().map(|r| r.name())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Prune `request.text`. Never fails: problems come back as warnings with
    /// the input unchanged.
    pub async fn prune(&self, request: &PruneRequest) -> PruneResponse {
        let started = Instant::now();
        let deadline = Deadline::after(request.options.timeout());
        let prune_id = new_prune_id();
        let (lines, trailing_newline) = split_lines(&request.text);
        let mut warnings = Vec::new();

        let selection = self
            .select(request, &lines, &deadline, &mut warnings)
            .await
            .and_then(|selection| {
                verify(&selection.removed, lines.len(), request)?;
                Ok(selection)
            })
            .and_then(|selection| {
                deadline.check()?;
                Ok(selection)
            });

        let selection = match selection {
            Ok(selection) => selection,
            Err(reason) => {
                warn!("Prune {prune_id} failed open: {reason:?}");
                warnings.push(reason.warning());
                return self.fail_open(
                    prune_id,
                    request,
                    &lines,
                    trailing_newline,
                    warnings,
                    started,
                );
            }
        };

        let annotations = annotate(&selection.removed, &lines, &prune_id);
        let pruned_text = render(
            &lines,
            trailing_newline,
            &selection.removed,
            &annotations,
            request.options.include_markers,
            request.options.annotate_lines,
        );

        let original = lines.len();
        let pruned = selection.removed.iter().filter(|&&r| r).count();
        let kept_lines: Vec<usize> = (1..=original)
            .filter(|&n| !selection.removed[n - 1])
            .collect();
        self.store.insert(RedactionRecord {
            prune_id: prune_id.clone(),
            original_lines: lines.iter().map(|l| l.to_string()).collect(),
            trailing_newline,
            kept_lines,
            annotations: annotations.clone(),
            created_at: Utc::now(),
            ttl: self.config.record_ttl,
        });

        let stats = PruneStats {
            original_lines: original,
            kept_lines: original - pruned,
            pruned_lines: pruned,
            pruned_ratio: ratio(pruned, original),
            source_type: Some(selection.source),
            reranker_used: selection.reranker_used,
            cache_hit: selection.cache_hit,
            elapsed_ms: elapsed_ms(started),
        };
        info!(
            "Pruned {prune_id}: {pruned}/{original} line(s) in {} block(s) ({} source{})",
            annotations.len(),
            selection.source,
            if selection.reranker_used { ", reranked" } else { "" },
        );

        PruneResponse {
            prune_id,
            pruned_text,
            annotations,
            stats,
            warnings,
            used_fallback: false,
        }
    }

    /// Record `request.text` unchanged under a fresh `prune_id` and report
    /// `warning`. Used by callers that could not prune at all.
    pub fn passthrough(&self, request: &PruneRequest, warning: StageWarning) -> PruneResponse {
        let (lines, trailing_newline) = split_lines(&request.text);
        self.fail_open(
            new_prune_id(),
            request,
            &lines,
            trailing_newline,
            vec![warning],
            Instant::now(),
        )
    }

    fn fail_open(
        &self,
        prune_id: String,
        request: &PruneRequest,
        lines: &[&str],
        trailing_newline: bool,
        warnings: Vec<StageWarning>,
        started: Instant,
    ) -> PruneResponse {
        self.store.insert(RedactionRecord {
            prune_id: prune_id.clone(),
            original_lines: lines.iter().map(|l| l.to_string()).collect(),
            trailing_newline,
            kept_lines: (1..=lines.len()).collect(),
            annotations: Vec::new(),
            created_at: Utc::now(),
            ttl: self.config.record_ttl,
        });
        PruneResponse {
            prune_id,
            pruned_text: request.text.clone(),
            annotations: Vec::new(),
            stats: PruneStats {
                original_lines: lines.len(),
                kept_lines: lines.len(),
                pruned_lines: 0,
                pruned_ratio: 0.0,
                source_type: None,
                reranker_used: false,
                cache_hit: false,
                elapsed_ms: elapsed_ms(started),
            },
            warnings,
            used_fallback: true,
        }
    }

    async fn select(
        &self,
        request: &PruneRequest,
        lines: &[&str],
        deadline: &Deadline,
        warnings: &mut Vec<StageWarning>,
    ) -> std::result::Result<Selection, FailOpen> {
        let options = &request.options;
        options.validate().map_err(FailOpen::InvalidOptions)?;
        if request.text.len() > self.config.max_input_bytes {
            return Err(FailOpen::InputTooLarge(format!(
                "{} bytes exceeds max_input_bytes={}",
                request.text.len(),
                self.config.max_input_bytes
            )));
        }
        if lines.len() > self.config.max_input_lines {
            return Err(FailOpen::InputTooLarge(format!(
                "{} lines exceeds max_input_lines={}",
                lines.len(),
                self.config.max_input_lines
            )));
        }
        deadline.check()?;
        let n = lines.len();
        if n < options.min_keep_lines {
            return Err(FailOpen::ConstraintUnsatisfiable {
                lines: n,
                min_keep_lines: options.min_keep_lines,
            });
        }

        let source = match request.source_type {
            SourceType::Auto => heuristics::detect_source(lines),
            other => other,
        };
        let classes = heuristics::classify(lines, source);
        deadline.check()?;

        let max_prunable = ((n as f64 * options.max_prune_ratio).floor() as usize)
            .min(n - options.min_keep_lines);
        let mut selection = Selection {
            removed: vec![false; n],
            source,
            reranker_used: false,
            cache_hit: false,
        };
        if max_prunable == 0 {
            debug!("Nothing prunable: {n} line(s), max_prunable=0");
            return Ok(selection);
        }

        let remote = if options.use_reranker {
            self.remote_scores(request, lines, source, deadline, warnings)
                .await
        } else {
            None
        };
        if let Some((_, cache_hit)) = &remote {
            selection.reranker_used = true;
            selection.cache_hit = *cache_hit;
        }
        deadline.check()?;

        let goal_terms = heuristics::terms(&request.goal_hint);
        let mut candidates: Vec<(f32, usize)> = Vec::new();
        for (i, (line, class)) in lines.iter().zip(&classes).enumerate() {
            if i % 512 == 0 {
                deadline.check()?;
            }
            let score = match class {
                LineClass::Protected => continue,
                LineClass::Blank => BLANK_SCORE,
                LineClass::Duplicate => DUPLICATE_SCORE,
                LineClass::Ordinary => match &remote {
                    Some((scores, _)) => scores.get(i).copied().unwrap_or(0.0).max(DUPLICATE_SCORE),
                    None => heuristics::relevance(line, &goal_terms),
                },
            };
            if score < self.config.keep_score {
                candidates.push((score, i));
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        for &(_, i) in candidates.iter().take(max_prunable) {
            selection.removed[i] = true;
        }

        if options.include_markers {
            restore_single_line_blocks(&mut selection.removed);
        }
        Ok(selection)
    }

    /// Scores from the reranker, or `None` to use local scoring. The flag is
    /// whether the scores came from the cache.
    async fn remote_scores(
        &self,
        request: &PruneRequest,
        lines: &[&str],
        source: SourceType,
        deadline: &Deadline,
        warnings: &mut Vec<StageWarning>,
    ) -> Option<(Vec<f32>, bool)> {
        let Some(reranker) = self.reranker.as_ref() else {
            warnings.push(StageWarning::new("reranker_failed", "no reranker configured"));
            return None;
        };
        if lines.len() > self.config.max_rerank_lines {
            warnings.push(StageWarning::new(
                "reranker_failed",
                format!(
                    "{} lines exceeds max_rerank_lines={}",
                    lines.len(),
                    self.config.max_rerank_lines
                ),
            ));
            return None;
        }

        let key = RerankKey::new(
            &request.text,
            &request.goal_hint,
            format!("{source}:{}", lines.len()),
        );
        if let Some(scores) = self.cache.get(&key) {
            debug!("Rerank cache hit ({} lines)", lines.len());
            return Some((scores, true));
        }

        let owned: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        let budget = self.config.rerank_timeout.min(deadline.remaining());
        let call = reranker.rerank(&owned, &request.goal_hint);
        let outcome = tokio::time::timeout(budget, call).await;
        let failure = match outcome {
            Ok(Ok(scores)) if scores.len() == lines.len() => {
                self.cache.put(key, scores.clone());
                return Some((scores, false));
            }
            Ok(Ok(scores)) => format!(
                "{} returned {} score(s) for {} line(s)",
                reranker.name(),
                scores.len(),
                lines.len()
            ),
            Ok(Err(e)) => format!("{}: {e}", reranker.name()),
            Err(_) => format!("{} timed out after {budget:?}", reranker.name()),
        };
        warn!("Reranker failed, using local scoring: {failure}");
        warnings.push(StageWarning::new("reranker_failed", failure));
        None
    }

    /// Return original lines for `request.ranges` (all lines when empty).
    pub fn recover(&self, request: &RecoverRequest) -> Result<String> {
        let record = self.store.get(&request.prune_id)?;
        Ok(recover_from(&record, request))
    }
}

impl Redactor for Pruner {
    fn prune<'a>(&'a self, request: PruneRequest) -> RedactFuture<'a, PruneResponse> {
        Box::pin(async move { Pruner::prune(self, &request).await })
    }

    fn recover<'a>(&'a self, request: RecoverRequest) -> RedactFuture<'a, Result<String>> {
        Box::pin(async move { Pruner::recover(self, &request) })
    }
}

/// `pr_` followed by a time-ordered UUID.
pub fn new_prune_id() -> String {
    format!("pr_{}", uuid::Uuid::now_v7().simple())
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Un-remove blocks of one line: their marker would be no shorter.
fn restore_single_line_blocks(removed: &mut [bool]) {
    for (start, end) in blocks(removed) {
        if end - start < 1 {
            removed[start] = false;
        }
    }
}

/// Contiguous removed runs as 0-indexed inclusive `(start, end)` pairs.
fn blocks(removed: &[bool]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, &r) in removed.iter().enumerate() {
        match (r, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                out.push((s, i - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, removed.len() - 1));
    }
    out
}

/// The bounds every successful prune must meet.
fn verify(removed: &[bool], n: usize, request: &PruneRequest) -> std::result::Result<(), FailOpen> {
    let pruned = removed.iter().filter(|&&r| r).count();
    if removed.len() != n {
        return Err(FailOpen::Internal(format!("selection covers {} of {n} lines", removed.len())));
    }
    let options = &request.options;
    if ratio(pruned, n) > options.max_prune_ratio || n - pruned < options.min_keep_lines {
        return Err(FailOpen::Internal(format!(
            "selection of {pruned}/{n} violates max_prune_ratio={} or min_keep_lines={}",
            options.max_prune_ratio, options.min_keep_lines
        )));
    }
    Ok(())
}

fn block_reason(lines: &[&str], start: usize, end: usize) -> PruneReason {
    let block = lines.get(start..=end).unwrap_or_default();
    if block.iter().all(|l| l.trim().is_empty()) {
        return PruneReason::Blank;
    }
    let mut seen: HashSet<&str> = lines
        .get(..start)
        .unwrap_or_default()
        .iter()
        .map(|l| l.trim())
        .collect();
    let all_redundant = block.iter().all(|l| {
        let t = l.trim();
        t.is_empty() || !seen.insert(t)
    });
    if all_redundant {
        PruneReason::Duplicate
    } else {
        PruneReason::LowRelevance
    }
}

/// The single-line marker for a removed block.
pub fn marker_text(
    prune_id: &str,
    start_line: usize,
    end_line: usize,
    count: usize,
    reason: PruneReason,
) -> String {
    format!(
        "[... {count} line(s) pruned: {start_line}-{end_line} ({reason}); \
         recover with prune_id={prune_id} ...]"
    )
}

fn annotate(removed: &[bool], lines: &[&str], prune_id: &str) -> Vec<Annotation> {
    blocks(removed)
        .into_iter()
        .map(|(start, end)| {
            let reason = block_reason(lines, start, end);
            let (start_line, end_line, count) = (start + 1, end + 1, end - start + 1);
            Annotation {
                start_line,
                end_line,
                pruned_count: count,
                reason,
                marker: marker_text(prune_id, start_line, end_line, count, reason),
            }
        })
        .collect()
}

fn render(
    lines: &[&str],
    trailing_newline: bool,
    removed: &[bool],
    annotations: &[Annotation],
    include_markers: bool,
    annotate_lines: bool,
) -> String {
    let width = prefix_width(lines.len());
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut next_annotation = annotations.iter().peekable();
    for (i, line) in lines.iter().enumerate() {
        let number = i + 1;
        if removed[i] {
            if let Some(a) = next_annotation.next_if(|a| a.start_line == number) {
                if include_markers {
                    out.push(a.marker.clone());
                }
            }
            continue;
        }
        if annotate_lines {
            out.push(format!("{}{line}", line_prefix(number, width)));
        } else {
            out.push((*line).to_string());
        }
    }
    let mut text = out.join("\n");
    if trailing_newline {
        text.push('\n');
    }
    text
}

/// Rebuild text for the requested ranges of a record.
pub fn recover_from(record: &RedactionRecord, request: &RecoverRequest) -> String {
    let n = record.original_line_count();
    let width = prefix_width(n);
    let ranges: Vec<(usize, usize)> = if request.ranges.is_empty() {
        if n == 0 { Vec::new() } else { vec![(1, n)] }
    } else {
        request.ranges.iter().filter_map(|r| r.clamp(n)).collect()
    };

    let mut out: Vec<String> = Vec::new();
    let mut last_emitted = 0;
    for (start, end) in ranges {
        for number in start..=end {
            let line = &record.original_lines[number - 1];
            if request.include_line_numbers {
                out.push(format!("{}{line}", line_prefix(number, width)));
            } else {
                out.push(line.clone());
            }
            last_emitted = number;
        }
    }
    let mut text = out.join("\n");
    if record.trailing_newline && last_emitted == n && n > 0 {
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityFuture;
    use crate::error::{CapabilityError, GateError};
    use crate::prune::types::PruneOptions;

    fn log_text() -> String {
        let mut lines = vec!["2025-01-04 12:00:00 INFO service starting".to_string()];
        for i in 0..30 {
            lines.push(format!("2025-01-04 12:00:{i:02} INFO heartbeat ok seq={i}"));
        }
        lines.push("2025-01-04 12:01:00 ERROR database connection refused".into());
        for i in 0..10 {
            lines.push(format!("2025-01-04 12:01:{i:02} INFO retrying pool slot {i}"));
        }
        lines.push("2025-01-04 12:02:00 INFO shutdown".into());
        lines.join("\n") + "\n"
    }

    fn strip_prefix(line: &str) -> Option<(usize, &str)> {
        let (num, rest) = line.split_once("| ")?;
        Some((num.trim().parse().ok()?, rest))
    }

    #[tokio::test]
    async fn respects_bounds_and_keeps_errors() {
        let pruner = Pruner::default();
        let text = log_text();
        let request = PruneRequest::new(&text, "why did the database connection fail");
        let resp = pruner.prune(&request).await;

        assert!(!resp.used_fallback);
        let n = resp.stats.original_lines;
        assert_eq!(n, 43);
        assert!(resp.stats.pruned_ratio <= 0.5);
        assert!(resp.stats.kept_lines >= 5);
        assert!(resp.stats.pruned_lines > 0);
        assert_eq!(resp.stats.source_type, Some(SourceType::Log));
        let pruned = &resp.pruned_text;
        assert!(pruned.contains("ERROR database connection refused"));
        assert!(pruned.starts_with("2025-01-04 12:00:00 INFO service starting"));
        assert!(pruned.ends_with("INFO shutdown\n"));
    }

    #[tokio::test]
    async fn markers_match_annotations() {
        let pruner = Pruner::default();
        let resp = pruner
            .prune(&PruneRequest::new(log_text(), "database connection"))
            .await;
        assert!(!resp.annotations.is_empty());
        let pruned = &resp.pruned_text;
        let mut previous_end = 0;
        for a in &resp.annotations {
            assert!(a.start_line > previous_end);
            assert!(a.end_line >= a.start_line);
            assert_eq!(a.pruned_count, a.end_line - a.start_line + 1);
            assert!(a.pruned_count >= 2);
            assert!(!a.marker.contains('\n'));
            assert!(a.marker.contains(&resp.prune_id));
            let hits = pruned.lines().filter(|l| *l == a.marker).count();
            assert_eq!(hits, 1);
            previous_end = a.end_line;
        }
        let total: usize = resp.annotations.iter().map(|a| a.pruned_count).sum();
        assert_eq!(total, resp.stats.pruned_lines);
    }

    #[tokio::test]
    async fn annotated_lines_preserve_order() {
        let pruner = Pruner::default();
        let text = log_text();
        let original: Vec<&str> = text.lines().collect();
        let options = PruneOptions::default()
            .with_annotate_lines(true)
            .with_markers(false);
        let resp = pruner
            .prune(&PruneRequest::new(&text, "").with_options(options))
            .await;

        let mut last = 0;
        for line in resp.pruned_text.lines() {
            let (number, content) = strip_prefix(line).unwrap();
            assert!(number > last);
            assert_eq!(original[number - 1], content);
            last = number;
        }
        let first = resp.pruned_text.lines().next().unwrap();
        assert!(first.starts_with("   1| "));
    }

    #[tokio::test]
    async fn recovery_returns_original() {
        let pruner = Pruner::default();
        let text = log_text();
        let resp = pruner.prune(&PruneRequest::new(&text, "")).await;
        let n = resp.stats.original_lines;

        let id = &resp.prune_id;
        let all = pruner.recover(&RecoverRequest::range(id, 1, n)).unwrap();
        assert_eq!(all, text);
        let also_all = pruner.recover(&RecoverRequest::all(id)).unwrap();
        assert_eq!(also_all, text);

        let clamped = pruner.recover(&RecoverRequest::range(id, 0, 2)).unwrap();
        assert_eq!(clamped, original_head(&text, 2));

        let numbered = pruner
            .recover(&RecoverRequest {
                include_line_numbers: true,
                ..RecoverRequest::range(&resp.prune_id, 2, 2)
            })
            .unwrap();
        assert!(numbered.starts_with("   2| 2025-01-04"));
    }

    fn original_head(text: &str, n: usize) -> String {
        text.lines().take(n).collect::<Vec<_>>().join("\n")
    }

    #[tokio::test]
    async fn recovery_errors_are_explicit() {
        let pruner = Pruner::new(PrunerConfig::default().with_record_ttl(Duration::ZERO));
        let resp = pruner.prune(&PruneRequest::new(log_text(), "")).await;
        assert!(matches!(
            pruner.recover(&RecoverRequest::all(&resp.prune_id)),
            Err(GateError::RecordExpired(_))
        ));
        assert!(matches!(
            pruner.recover(&RecoverRequest::all("pr_missing")),
            Err(GateError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn fails_open_on_oversized_input_with_tiny_timeout() {
        let pruner = Pruner::new(PrunerConfig::default().with_input_limits(1024, 100));
        let text = "line of filler text\n".repeat(500);
        let options = PruneOptions::default().with_timeout(Duration::from_millis(1));
        let resp = pruner
            .prune(&PruneRequest::new(&text, "goal").with_options(options))
            .await;
        assert_eq!(resp.pruned_text, text);
        assert!(resp.used_fallback);
        assert!(resp.annotations.is_empty());
        assert_eq!(resp.warnings[0].code, "input_too_large");
        let all = RecoverRequest::all(&resp.prune_id);
        assert_eq!(pruner.recover(&all).unwrap(), text);
    }

    #[tokio::test]
    async fn zero_timeout_fails_open() {
        let pruner = Pruner::default();
        let text = log_text();
        let options = PruneOptions::default().with_timeout(Duration::ZERO);
        let resp = pruner
            .prune(&PruneRequest::new(&text, "").with_options(options))
            .await;
        assert!(resp.used_fallback);
        assert_eq!(resp.pruned_text, text);
        assert_eq!(resp.warnings[0].code, "timeout");
    }

    #[tokio::test]
    async fn too_few_lines_is_unsatisfiable() {
        let pruner = Pruner::default();
        let resp = pruner.prune(&PruneRequest::new("a\nb\nc", "")).await;
        assert!(resp.used_fallback);
        assert_eq!(resp.pruned_text, "a\nb\nc");
        assert_eq!(resp.warnings[0].code, "constraint_unsatisfiable");
    }

    #[tokio::test]
    async fn invalid_options_fail_open() {
        let pruner = Pruner::default();
        let options = PruneOptions::default().with_max_prune_ratio(2.0);
        let resp = pruner
            .prune(&PruneRequest::new(log_text(), "").with_options(options))
            .await;
        assert!(resp.used_fallback);
        assert_eq!(resp.warnings[0].code, "invalid_options");
    }

    #[tokio::test]
    async fn code_definitions_survive() {
        let mut text = String::from("use std::fmt;\n");
        for i in 0..20 {
            text.push_str(&format!("    let value_{i} = compute({i});\n"));
        }
        text.push_str("pub fn render(out: &mut String) {\n");
        for i in 0..20 {
            text.push_str(&format!("    out.push_str(\"{i}\");\n"));
        }
        text.push_str("}\n");
        let resp = Pruner::default()
            .prune(&PruneRequest::new(&text, "").with_source_type(SourceType::Code))
            .await;
        assert!(resp.stats.pruned_lines > 0);
        let pruned = &resp.pruned_text;
        assert!(pruned.contains("pub fn render(out: &mut String) {"));
        assert!(pruned.contains("use std::fmt;"));
    }

    #[tokio::test]
    async fn blank_and_duplicate_lines_go_first() {
        let mut lines = vec!["header".to_string()];
        for i in 0..10 {
            lines.push(format!("unique line number {i}"));
            lines.push(String::new());
            lines.push("repeated noise".into());
        }
        lines.push("footer".into());
        let text = lines.join("\n");
        let options = PruneOptions::default().with_max_prune_ratio(0.6);
        let resp = Pruner::default()
            .prune(&PruneRequest::new(&text, "").with_options(options))
            .await;
        for i in 0..10 {
            let line = format!("unique line number {i}");
            assert!(resp.pruned_text.contains(&line));
        }
        assert_eq!(resp.stats.pruned_lines, 18);
        assert_eq!(resp.annotations.len(), 9);
        for a in &resp.annotations {
            assert_eq!(a.reason, PruneReason::Duplicate);
        }
    }

    struct ScriptedReranker {
        reply: std::result::Result<Vec<f32>, CapabilityError>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl Rerank for ScriptedReranker {
        fn rerank<'a>(
            &'a self,
            lines: &'a [String],
            _goal: &'a str,
        ) -> CapabilityFuture<'a, Vec<f32>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let reply = self.reply.clone().map(|mut s| {
                s.resize(lines.len(), 0.0);
                s
            });
            Box::pin(async move { reply })
        }
    }

    #[tokio::test]
    async fn reranker_scores_are_cached() {
        let text = log_text();
        let n = text.lines().count();
        let scores: Vec<f32> = (0..n)
            .map(|i| if (1..=20).contains(&i) { 0.1 } else { 0.9 })
            .collect();
        let reranker = Arc::new(ScriptedReranker {
            reply: Ok(scores),
            calls: Default::default(),
        });
        let pruner = Pruner::default().with_reranker(reranker.clone());
        let options = PruneOptions::default().with_reranker(true);
        let request = PruneRequest::new(&text, "db").with_options(options);

        let first = pruner.prune(&request).await;
        assert!(first.stats.reranker_used);
        assert!(!first.stats.cache_hit);
        assert_eq!(first.stats.pruned_lines, 20);
        let second = pruner.prune(&request).await;
        assert!(second.stats.cache_hit);
        assert_eq!(reranker.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let strip = |r: &PruneResponse| r.pruned_text.replace(&r.prune_id, "");
        assert_eq!(strip(&first), strip(&second));
        assert_eq!(pruner.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn reranker_failure_falls_back_to_local() {
        let reranker = Arc::new(ScriptedReranker {
            reply: Err(CapabilityError::RateLimited("slow down".into())),
            calls: Default::default(),
        });
        let pruner = Pruner::default().with_reranker(reranker);
        let options = PruneOptions::default().with_reranker(true);
        let resp = pruner
            .prune(&PruneRequest::new(log_text(), "db").with_options(options))
            .await;
        assert!(!resp.used_fallback);
        assert!(!resp.stats.reranker_used);
        assert!(resp.stats.pruned_lines > 0);
        assert_eq!(resp.warnings[0].code, "reranker_failed");
    }

    #[test]
    fn single_line_blocks_are_restored() {
        let mut removed = vec![false, true, false, true, true, false];
        restore_single_line_blocks(&mut removed);
        assert_eq!(removed, vec![false, false, false, true, true, false]);
    }
}
