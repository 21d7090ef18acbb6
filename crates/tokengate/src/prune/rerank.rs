//! Remote reranking and its response cache.
//!
//! The reranker is strictly opt-in. Every call is timeout-bounded by the
//! caller and any failure falls back to local heuristic scoring, so nothing
//! here can fail a prune.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::capabilities::{CapabilityFuture, Rerank};
use crate::context::handles::content_hash;
use crate::error::CapabilityError;

// ── Cache ──────────────────────────────────────────────────────────

/// Cache key: (text hash, goal hint, options fingerprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RerankKey {
    text_hash: String,
    goal_hint: String,
    fingerprint: String,
}

impl RerankKey {
    pub fn new(text: &str, goal_hint: &str, fingerprint: impl Into<String>) -> Self {
        Self {
            text_hash: content_hash(text),
            goal_hint: goal_hint.to_string(),
            fingerprint: fingerprint.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    scores: Vec<f32>,
    inserted_at: Instant,
}

/// Bounded TTL cache of reranker scores.
///
/// Shared across concurrent prune calls. When full, the oldest entry is
/// evicted; entries older than the TTL count as misses.
#[derive(Debug)]
pub struct RerankCache {
    entries: Mutex<HashMap<RerankKey, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for RerankCache {
    fn default() -> Self {
        Self::new(256, Duration::from_secs(600))
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl RerankCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up cached scores.
    pub fn get(&self, key: &RerankKey) -> Option<Vec<f32>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.scores.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        fresh
    }

    /// Store scores, evicting the oldest entry at capacity.
    pub fn put(&self, key: RerankKey, scores: Vec<f32>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, v)| v.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                scores,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let stats = self.stats();
        let total = stats.hits + stats.misses;
        if total == 0 {
            0.0
        } else {
            stats.hits as f64 / total as f64
        }
    }
}

// ── HTTP reranker ──────────────────────────────────────────────────

/// Environment variable holding the reranker endpoint URL.
pub const RERANK_URL_ENV: &str = "TOKENGATE_RERANK_URL";
/// Environment variable holding the reranker model name.
pub const RERANK_MODEL_ENV: &str = "TOKENGATE_RERANK_MODEL";
/// Environment variable holding the reranker API key.
pub const RERANK_KEY_ENV: &str = "TOKENGATE_RERANK_API_KEY";

const DEFAULT_RERANK_MODEL: &str = "rerank-v3.5";

#[derive(Serialize)]
struct RerankBody<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
    return_documents: bool,
}

#[derive(Deserialize)]
struct RerankReply {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

/// Client for a Cohere/Jina-style `/rerank` endpoint.
pub struct HttpReranker {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl std::fmt::Debug for HttpReranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReranker")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl HttpReranker {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tokengate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Build from `TOKENGATE_RERANK_URL`, `TOKENGATE_RERANK_API_KEY` and
    /// optionally `TOKENGATE_RERANK_MODEL`. `Ok(None)` when the URL or key is
    /// unset.
    pub fn from_env(timeout: Duration) -> Result<Option<Self>, String> {
        let url = std::env::var(RERANK_URL_ENV);
        let key = std::env::var(RERANK_KEY_ENV);
        let (Ok(url), Ok(key)) = (url, key) else {
            return Ok(None);
        };
        let model = std::env::var(RERANK_MODEL_ENV).unwrap_or_else(|_| DEFAULT_RERANK_MODEL.into());
        Self::new(url, model, key, timeout).map(Some)
    }

    async fn call(&self, lines: &[String], goal_hint: &str) -> Result<Vec<f32>, CapabilityError> {
        let body = RerankBody {
            model: &self.model,
            query: goal_hint,
            documents: lines,
            top_n: lines.len(),
            return_documents: false,
        };
        let start = Instant::now();
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        debug!(
            "Rerank response: HTTP {} in {:.2}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );
        if !status.is_success() {
            return Err(CapabilityError::from_status(status.as_u16(), &text));
        }
        trace!("Rerank payload: {}", crate::preview(&text, 300));
        let reply: RerankReply =
            serde_json::from_str(&text).map_err(|e| CapabilityError::Malformed(e.to_string()))?;
        scores_in_order(reply.results, lines.len())
    }
}

/// Reorder `(index, score)` results into one score per input line.
fn scores_in_order(
    results: Vec<RerankResult>,
    expected: usize,
) -> Result<Vec<f32>, CapabilityError> {
    let mut scores: Vec<Option<f32>> = vec![None; expected];
    for r in results {
        let slot = scores
            .get_mut(r.index)
            .ok_or_else(|| CapabilityError::Malformed(format!("index {} out of range", r.index)))?;
        if !r.relevance_score.is_finite() {
            return Err(CapabilityError::Malformed(format!("non-finite score at {}", r.index)));
        }
        *slot = Some(r.relevance_score);
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            s.ok_or_else(|| CapabilityError::Malformed(format!("missing score for line {i}")))
        })
        .collect()
}

impl Rerank for HttpReranker {
    fn rerank<'a>(
        &'a self,
        lines: &'a [String],
        goal_hint: &'a str,
    ) -> CapabilityFuture<'a, Vec<f32>> {
        Box::pin(self.call(lines, goal_hint))
    }

    fn name(&self) -> &str {
        &self.model
    }
}
