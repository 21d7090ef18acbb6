//! Pipeline configuration.
//!
//! [`GateConfig`] groups the per-stage configs. Every field has a working
//! default; [`GateConfig::from_env`] overlays `TOKENGATE_*` environment
//! variables on top of those defaults.
//!
//! Credentials never live here. The reranker and summarizer clients read
//! their API keys straight from the environment when they're built (see
//! [`HttpReranker::from_env`](crate::prune::HttpReranker::from_env) and
//! [`LlmSummarizer::from_env`](crate::api::LlmSummarizer::from_env)), so a
//! `GateConfig` can be logged or shared without leaking secrets.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::context::{AccountantConfig, CompactorConfig, SanitizerConfig};
use crate::prune::{PruneOptions, PrunerConfig};
use crate::telemetry::HubConfig;

/// Enable/disable wrapper with inner configuration.
///
/// When `enabled` is `false` the stage is skipped regardless of the inner
/// config values.
#[derive(Debug, Clone)]
pub struct Toggle<T: Default> {
    pub enabled: bool,
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// A disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }

    pub fn enabled(config: T) -> Self {
        Self {
            enabled: true,
            config,
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

/// How the orchestrator drives the redactor.
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    /// Options sent with every prune call.
    pub options: PruneOptions,
    /// Messages smaller than this are never sent to the redactor.
    pub min_message_tokens: usize,
    /// Added to `options.timeout` for the orchestrator's own deadline on a
    /// redactor call (covers transport to a remote pruner).
    pub call_grace: Duration,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            options: PruneOptions::default(),
            min_message_tokens: 500,
            call_grace: Duration::from_secs(1),
        }
    }
}

/// Orchestrator-level switches.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// When both a fallback model and redaction could help, try the
    /// fallback first. When `false`, redaction runs first and the fallback
    /// is taken only if the conversation is still over budget afterwards.
    pub prefer_fallback: bool,
    /// Reserved response margin when a request doesn't specify one.
    pub default_reserved: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            prefer_fallback: true,
            default_reserved: 4_096,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    pub accountant: AccountantConfig,
    pub sanitizer: SanitizerConfig,
    pub pruner: PrunerConfig,
    pub redaction: Toggle<RedactionConfig>,
    pub compaction: Toggle<CompactorConfig>,
    pub orchestrator: OrchestratorConfig,
    pub hub: HubConfig,
}

impl GateConfig {
    /// Defaults overlaid with `TOKENGATE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |name: &str| lookup(name);

        if let Some(v) = parse(&get, "TOKENGATE_MASK_THRESHOLD") {
            config.sanitizer.mask_threshold_tokens = v;
        }
        if let Some(v) = parse_ratio(&get, "TOKENGATE_FALLBACK_RATIO") {
            config.sanitizer.fallback_ratio = v;
        }
        if let Some(v) = parse_ratio(&get, "TOKENGATE_COMPACTION_THRESHOLD") {
            config.compaction.config.trigger_ratio = v;
        }
        if let Some(v) = parse(&get, "TOKENGATE_PRESERVE_COUNT") {
            config.compaction.config.preserve_count = v;
        }
        if let Some(v) = parse(&get, "TOKENGATE_COMPACTION_ENABLED") {
            config.compaction.enabled = v;
        }
        if let Some(v) = parse_ratio(&get, "TOKENGATE_MAX_PRUNE_RATIO") {
            config.redaction.config.options.max_prune_ratio = v;
        }
        if let Some(v) = parse(&get, "TOKENGATE_MIN_KEEP_LINES") {
            config.redaction.config.options.min_keep_lines = v;
        }
        if let Some(v) = parse(&get, "TOKENGATE_USE_RERANKER") {
            config.redaction.config.options.use_reranker = v;
        }
        if let Some(v) = parse(&get, "TOKENGATE_REDACTION_ENABLED") {
            config.redaction.enabled = v;
        }
        if let Some(v) = parse::<u64>(&get, "TOKENGATE_REDACTION_TTL_SECS") {
            config.pruner.record_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&get, "TOKENGATE_RERANK_CACHE_TTL_SECS") {
            config.pruner.rerank_cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse(&get, "TOKENGATE_HUB_BACKLOG") {
            config.hub.backlog_capacity = v;
        }
        if let Some(v) = parse(&get, "TOKENGATE_PREFER_FALLBACK") {
            config.orchestrator.prefer_fallback = v;
        }
        if let Some(v) = parse(&get, "TOKENGATE_RESERVED_TOKENS") {
            config.orchestrator.default_reserved = v;
        }
        config
    }

    pub fn with_sanitizer(mut self, sanitizer: SanitizerConfig) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn with_compaction(mut self, compaction: Toggle<CompactorConfig>) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_redaction(mut self, redaction: Toggle<RedactionConfig>) -> Self {
        self.redaction = redaction;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = get(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}

fn parse_ratio(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<f64> {
    let v: f64 = parse(get, name)?;
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Some(v)
    } else {
        warn!("Ignoring {name}={v}: must be within [0, 1]");
        None
    }
}
