//! The budget state machine.
//!
//! ```text
//! Start ─▶ Account ─┬─ Fits ─────────────────────────────────────▶ Done
//!                   └─ OverBudget ─▶ Sanitize ─┬─ Fits ──────────▶ Done
//!                                              ├─ FallbackRequested ─▶ Account (new limit)
//!                                              └─ OverBudget ─▶ Redact ─┬─ Fits ─▶ Done
//!                                                                       ├─ FallbackRequested ─▶ Account
//!                                                                       └─ OverBudget ─▶ Compact ─▶ Done
//! ```
//!
//! Each stage runs at most once per pass because the transition table only
//! moves forward. The only way back to `Account` is a fallback restart,
//! bounded by [`MAX_FALLBACK_RESTARTS`]. `Redact` only requests a fallback
//! when `prefer_fallback` is off and the sanitizer found one it deferred.
//!
//! Reaching `Done` while still over budget is not an error: the outcome is
//! marked `fits = false` and the last event is an `over_budget_event`. The
//! caller decides whether to forward anyway.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::events::{EventRecord, EventSink, LoggingSink, Outcome, Stage, StageWarning};
use crate::capabilities::{HandleStore, Summarize, TokenizerRegistry};
use crate::config::GateConfig;
use crate::context::accountant::{ConversationCount, TokenAccountant, TokenBudget, TokenCategory};
use crate::context::compactor::{Compactor, SUMMARY_PREFIX};
use crate::context::handles::{InMemoryHandleStore, MaskedHandle};
use crate::context::models::{ModelCatalog, ModelSpec};
use crate::context::sanitizer::{FallbackDecision, Sanitizer, is_masked};
use crate::error::{GateError, Result};
use crate::prune::{PruneRequest, Pruner, Redactor};
use crate::{Message, MessageRole};

/// Fallback restarts allowed per run.
pub const MAX_FALLBACK_RESTARTS: usize = 1;

/// Characters of the latest user message used as the redaction goal hint.
const GOAL_HINT_CHARS: usize = 500;

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Start,
    Account,
    Sanitize,
    Redact,
    Compact,
    Done,
}

/// What a state reported when it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Fits,
    OverBudget,
    FallbackRequested,
}

/// The transition table.
pub fn transition(state: State, signal: Signal) -> State {
    match state {
        State::Start => State::Account,
        State::Account => match signal {
            Signal::Fits => State::Done,
            Signal::OverBudget | Signal::FallbackRequested => State::Sanitize,
        },
        State::Sanitize => match signal {
            Signal::Fits => State::Done,
            Signal::OverBudget => State::Redact,
            Signal::FallbackRequested => State::Account,
        },
        State::Redact => match signal {
            Signal::Fits => State::Done,
            Signal::OverBudget => State::Compact,
            Signal::FallbackRequested => State::Account,
        },
        State::Compact | State::Done => State::Done,
    }
}

/// One conversation to fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub session_id: String,
    /// Target model name. Looked up in the catalog for limit and family.
    pub model: String,
    pub messages: Vec<Message>,
    /// Overrides the catalog's context limit.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Overrides the catalog's provider family.
    #[serde(default)]
    pub family: Option<String>,
    /// Overrides the configured reserved response margin.
    #[serde(default)]
    pub reserved: Option<usize>,
}

impl PipelineRequest {
    /// Messages are re-indexed by position.
    pub fn new(
        session_id: impl Into<String>,
        model: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            model: model.into(),
            messages: crate::index_conversation(messages),
            limit: None,
            family: None,
            reserved: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn with_reserved(mut self, reserved: usize) -> Self {
        self.reserved = Some(reserved);
        self
    }
}

/// Result of one orchestrator run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub session_id: String,
    /// Model to forward to (differs from the request after a fallback).
    pub model: String,
    pub limit: usize,
    pub conversation: Vec<Message>,
    pub budget: TokenBudget,
    /// Handles created by masking, in creation order.
    pub handles: Vec<MaskedHandle>,
    /// Prune ids of messages that were actually reduced.
    pub prune_ids: Vec<String>,
    /// Every event emitted, in emission order.
    pub events: Vec<EventRecord>,
    pub fits: bool,
    /// Requested model, when a fallback replaced it.
    pub fallback_from: Option<String>,
}

impl PipelineOutcome {
    pub fn tokens(&self) -> usize {
        self.budget.used()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.events.iter().map(|e| e.stage).collect()
    }
}

/// Mutable state of one run. Never shared between runs.
struct Run {
    session_id: String,
    model: ModelSpec,
    budget: TokenBudget,
    conversation: Vec<Message>,
    count: ConversationCount,
    initial_tokens: Option<usize>,
    events: Vec<EventRecord>,
    handles: Vec<MaskedHandle>,
    prune_ids: Vec<String>,
    redaction_attempted: HashSet<usize>,
    restarts: usize,
    fallback_from: Option<String>,
    deferred_fallback: bool,
}

impl Run {
    fn tokens(&self) -> usize {
        self.count.total()
    }

    fn signal(&self) -> Signal {
        if self.budget.fits() {
            Signal::Fits
        } else {
            Signal::OverBudget
        }
    }

    fn record(&self, stage: Stage, tokens_before: usize, outcome: Outcome) -> EventRecord {
        EventRecord {
            stage,
            session_id: self.session_id.clone(),
            timestamp: chrono::Utc::now(),
            tokens_before,
            tokens_after: self.tokens(),
            outcome,
            model: self.model.name.clone(),
            limit: self.budget.limit,
            reserved: self.budget.reserved,
            warnings: Vec::new(),
            detail: serde_json::Value::Null,
        }
    }

    fn set_count(&mut self, count: ConversationCount) {
        self.budget = self.budget.with_usage(count.totals);
        self.count = count;
    }
}

fn stage_outcome(reduced: bool, warnings: &[StageWarning]) -> Outcome {
    if reduced {
        Outcome::Reduced
    } else if !warnings.is_empty() {
        Outcome::Degraded
    } else {
        Outcome::Unchanged
    }
}

/// Runs the budget stages in order of increasing destructiveness.
///
/// Stateless between runs apart from the shared stores behind the injected
/// capabilities, so one instance serves concurrent requests.
pub struct Orchestrator {
    config: GateConfig,
    accountant: TokenAccountant,
    sanitizer: Sanitizer,
    redactor: Arc<dyn Redactor>,
    compactor: Option<Compactor>,
    catalog: ModelCatalog,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn builder(config: GateConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    fn resolve_model(&self, request: &PipelineRequest) -> Result<ModelSpec> {
        let known = self.catalog.get(&request.model);
        let spec = match (known, &request.family, request.limit) {
            (Some(spec), family, limit) => ModelSpec {
                family: family.clone().unwrap_or_else(|| spec.family.clone()),
                context_limit: limit.unwrap_or(spec.context_limit),
                ..spec.clone()
            },
            (None, Some(family), Some(limit)) => ModelSpec::new(&request.model, family, limit),
            (None, _, _) => return Err(GateError::UnknownModel(request.model.clone())),
        };
        Ok(spec)
    }

    /// Fit `request` into its model's budget.
    ///
    /// Only tokenizer failures (and an unknown model) are returned as errors;
    /// every other failure is a warning on the event trail.
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineOutcome> {
        let model = self.resolve_model(&request)?;
        let default_reserved = self.config.orchestrator.default_reserved;
        let reserved = request.reserved.unwrap_or(default_reserved);
        debug!(
            "[{}] Pipeline start: {} messages for {} (limit {}, reserved {reserved})",
            request.session_id,
            request.messages.len(),
            model.name,
            model.context_limit
        );

        let mut run = Run {
            session_id: request.session_id,
            budget: TokenBudget::new(model.context_limit, reserved),
            model,
            conversation: request.messages,
            count: ConversationCount::default(),
            initial_tokens: None,
            events: Vec::new(),
            handles: Vec::new(),
            prune_ids: Vec::new(),
            redaction_attempted: HashSet::new(),
            restarts: 0,
            fallback_from: None,
            deferred_fallback: false,
        };

        let mut state = State::Start;
        loop {
            let signal = match state {
                State::Start => Signal::OverBudget,
                State::Account => self.account(&mut run).await?,
                State::Sanitize => self.sanitize(&mut run).await?,
                State::Redact => self.redact(&mut run).await?,
                State::Compact => self.compact(&mut run).await?,
                State::Done => break,
            };
            let next = transition(state, signal);
            debug!("[{}] {state:?} --{signal:?}--> {next:?}", run.session_id);
            state = next;
        }

        self.finish(&mut run);
        Ok(PipelineOutcome {
            session_id: run.session_id,
            model: run.model.name,
            limit: run.budget.limit,
            fits: run.budget.fits(),
            conversation: run.conversation,
            budget: run.budget,
            handles: run.handles,
            prune_ids: run.prune_ids,
            events: run.events,
            fallback_from: run.fallback_from,
        })
    }

    fn emit(&self, run: &mut Run, event: EventRecord) {
        self.sink.emit(&event);
        run.events.push(event);
    }

    async fn account(&self, run: &mut Run) -> Result<Signal> {
        let before = run.tokens();
        let family = &run.model.family;
        let count = match self.accountant.count(family, &run.conversation).await {
            Ok(c) => c,
            Err(e) => {
                warn!("[{}] Accounting failed, aborting pass: {e}", run.session_id);
                let mut event = run.record(Stage::Account, before, Outcome::Degraded);
                event.warnings.push(StageWarning::from_error(&e));
                self.emit(run, event);
                return Err(e);
            }
        };
        run.set_count(count);
        let total = run.tokens();
        run.initial_tokens.get_or_insert(total);

        let signal = run.signal();
        let outcome = if signal == Signal::Fits {
            Outcome::Fits
        } else {
            Outcome::OverBudget
        };
        let mut event = run.record(Stage::Account, before, outcome);
        event.detail = json!({
            "by_category": run.budget.used_by_category,
            "pass": run.restarts + 1,
        });
        self.emit(run, event);
        debug!("[{}] {}", run.session_id, run.budget.to_log_string());
        Ok(signal)
    }

    async fn sanitize(&self, run: &mut Run) -> Result<Signal> {
        let before = run.tokens();
        let can_fall_back = run.restarts < MAX_FALLBACK_RESTARTS;
        let catalog = can_fall_back.then_some(&self.catalog);
        let out = self
            .sanitizer
            .sanitize(
                &run.model,
                &run.conversation,
                &run.count,
                &run.budget,
                catalog,
            )
            .await?;

        let handle_ids: Vec<&str> = out.handles.iter().map(|h| h.hash_id.as_str()).collect();
        let detail = json!({ "handles": handle_ids, "fallback": out.fallback });
        let outcome = stage_outcome(out.masked() > 0, &out.warnings);
        run.conversation = out.conversation;
        run.set_count(out.count);
        run.handles.extend(out.handles);

        let mut event = run.record(Stage::Sanitize, before, outcome);
        event.warnings = out.warnings;
        event.detail = detail;
        self.emit(run, event);

        let signal = run.signal();
        match (signal, out.fallback) {
            (Signal::OverBudget, Some(decision)) if self.config.orchestrator.prefer_fallback => {
                self.apply_fallback(run, decision);
                Ok(Signal::FallbackRequested)
            }
            (Signal::OverBudget, Some(decision)) => {
                debug!(
                    "[{}] Deferring fallback to {} until after redaction",
                    run.session_id, decision.target_model
                );
                run.deferred_fallback = true;
                Ok(signal)
            }
            _ => Ok(signal),
        }
    }

    fn apply_fallback(&self, run: &mut Run, decision: FallbackDecision) {
        let Some(target) = self.catalog.get(&decision.target_model) else {
            warn!(
                "Fallback target {} vanished from catalog",
                decision.target_model
            );
            return;
        };
        info!(
            "[{}] Falling back from {} ({}) to {} ({})",
            run.session_id, decision.from_model, run.budget.limit, target.name, target.context_limit
        );
        let from = decision.from_model.clone();
        run.fallback_from.get_or_insert(from);
        run.model = target.clone();
        run.budget = run.budget.with_limit(target.context_limit);
        run.restarts += 1;
        run.deferred_fallback = false;

        let before = run.tokens();
        let mut event = run.record(Stage::Fallback, before, Outcome::FallbackRequested);
        event.detail = serde_json::to_value(&decision).unwrap_or_default();
        self.emit(run, event);
    }

    /// Indices of messages worth sending to the redactor, largest first.
    fn redaction_candidates(&self, run: &Run, min_tokens: usize) -> Vec<usize> {
        let mut candidates: Vec<usize> = run
            .conversation
            .iter()
            .enumerate()
            .filter(|(i, m)| {
                !m.is_system()
                    && !is_masked(m)
                    && !m.content.starts_with(SUMMARY_PREFIX)
                    && !run.redaction_attempted.contains(i)
                    && run.count.per_message.get(*i).is_some_and(|c| {
                        c.category != TokenCategory::Memory && c.tokens >= min_tokens
                    })
            })
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| (Reverse(run.count.tokens_at(i)), i));
        candidates
    }

    fn goal_hint(conversation: &[Message]) -> String {
        conversation
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User && !m.content.starts_with(SUMMARY_PREFIX))
            .map(|m| crate::preview(&m.content, GOAL_HINT_CHARS))
            .unwrap_or_default()
    }

    async fn redact(&self, run: &mut Run) -> Result<Signal> {
        let before = run.tokens();
        let redaction = &self.config.redaction;
        let candidates = if redaction.enabled {
            self.redaction_candidates(run, redaction.config.min_message_tokens)
        } else {
            Vec::new()
        };

        if candidates.is_empty() {
            let mut event = run.record(Stage::Redact, before, Outcome::Skipped);
            event.detail = json!({
                "reason": if redaction.enabled { "no_candidates" } else { "disabled" }
            });
            self.emit(run, event);
            return Ok(self.after_redaction(run));
        }

        let options = &redaction.config.options;
        let deadline = options.timeout() + redaction.config.call_grace;
        let goal = Self::goal_hint(&run.conversation);
        let mut warnings = Vec::new();
        let mut reduced = Vec::new();
        let mut prune_ids = Vec::new();

        for index in candidates {
            if run.budget.fits() {
                break;
            }
            run.redaction_attempted.insert(index);
            let message = &run.conversation[index];
            let request = PruneRequest::new(message.content.as_str(), goal.as_str())
                .with_options(options.clone());

            let call = self.redactor.prune(request);
            let response = match tokio::time::timeout(deadline, call).await {
                Ok(r) => r,
                Err(_) => {
                    warn!("[{}] Redactor timed out on message {index}", run.session_id);
                    warnings.push(StageWarning::new(
                        "timeout",
                        format!("message {index}: redactor did not answer within {deadline:?}"),
                    ));
                    continue;
                }
            };
            warnings.extend(response.warnings);
            if response.used_fallback || response.pruned_text == message.content {
                debug!(
                    "[{}] Message {index} left as is by redactor",
                    run.session_id
                );
                continue;
            }

            let replacement = message.replaced_with(response.pruned_text);
            let family = &run.model.family;
            let new_count = self.accountant.count_message(family, &replacement).await?;
            debug!(
                "[{}] Redacted message {index}: {} -> {} tokens ({} lines pruned, {})",
                run.session_id,
                run.count.tokens_at(index),
                new_count.tokens,
                response.stats.pruned_lines,
                response.prune_id
            );
            let mut count = run.count.clone();
            count.replace(index, new_count);
            run.set_count(count);
            run.conversation[index] = replacement;
            reduced.push(index);
            prune_ids.push(response.prune_id);
        }

        let outcome = stage_outcome(!reduced.is_empty(), &warnings);
        let mut event = run.record(Stage::Redact, before, outcome);
        event.detail = json!({ "messages": reduced, "prune_ids": prune_ids });
        event.warnings = warnings;
        self.emit(run, event);
        run.prune_ids.extend(prune_ids);
        Ok(self.after_redaction(run))
    }

    /// Take a deferred fallback if redaction wasn't enough.
    fn after_redaction(&self, run: &mut Run) -> Signal {
        let signal = run.signal();
        if signal == Signal::Fits
            || !run.deferred_fallback
            || run.restarts >= MAX_FALLBACK_RESTARTS
        {
            return signal;
        }
        let required = run.budget.used() + run.budget.reserved;
        match self.catalog.select_fallback(&run.model.name, required) {
            Some(target) => {
                let decision = FallbackDecision {
                    from_model: run.model.name.clone(),
                    target_model: target.name.clone(),
                    target_limit: target.context_limit,
                };
                self.apply_fallback(run, decision);
                Signal::FallbackRequested
            }
            None => signal,
        }
    }

    async fn compact(&self, run: &mut Run) -> Result<Signal> {
        let before = run.tokens();
        let skip_reason = match &self.compactor {
            _ if !self.config.compaction.enabled => Some("disabled"),
            None => Some("no_summarizer"),
            Some(c) if !run.budget.exceeds_ratio(c.config().trigger_ratio) => Some("below_trigger"),
            Some(_) => None,
        };
        let Some(compactor) = self.compactor.as_ref().filter(|_| skip_reason.is_none()) else {
            let mut event = run.record(Stage::Compact, before, Outcome::Skipped);
            event.detail = json!({ "reason": skip_reason });
            self.emit(run, event);
            return Ok(run.signal());
        };

        let result = compactor
            .compact(&run.model.family, &run.conversation, &run.count)
            .await?;
        let summarized = run.conversation.len() + usize::from(result.summary_message.is_some())
            - result.conversation.len();
        let outcome = stage_outcome(result.compacted(), &result.warnings);
        let detail = json!({
            "summarized_messages": if result.compacted() { summarized } else { 0 },
            "preserved_messages": result.preserved_messages.len(),
        });
        run.conversation = result.conversation;
        run.set_count(result.count);

        let mut event = run.record(Stage::Compact, before, outcome);
        event.warnings = result.warnings;
        event.detail = detail;
        self.emit(run, event);
        Ok(run.signal())
    }

    fn finish(&self, run: &mut Run) {
        let initial = run.initial_tokens.unwrap_or_default();
        let fits = run.budget.fits();
        let outcome = if fits {
            Outcome::Fits
        } else {
            Outcome::OverBudget
        };
        let mut event = run.record(Stage::Done, initial, outcome);
        event.detail = json!({
            "fallback_from": run.fallback_from,
            "handles": run.handles.len(),
            "prune_ids": run.prune_ids,
            "overage": run.budget.overage(),
        });
        self.emit(run, event);

        if fits {
            info!(
                "[{}] Pipeline done: {initial} -> {} tokens on {}",
                run.session_id,
                run.tokens(),
                run.model.name
            );
        } else {
            warn!(
                "[{}] Still over budget after all stages: {} tokens, {} available on {}",
                run.session_id,
                run.tokens(),
                run.budget.available(),
                run.model.name
            );
        }
    }
}

/// Builder for [`Orchestrator`].
///
/// Only the tokenizer registry matters for correctness. Without a handle
/// store an in-memory one is used; without a redactor a local [`Pruner`]
/// is built from `config.pruner`; without a summarizer compaction is
/// skipped; without a sink events are logged.
pub struct OrchestratorBuilder {
    config: GateConfig,
    tokenizers: Option<Arc<TokenizerRegistry>>,
    handle_store: Option<Arc<dyn HandleStore>>,
    redactor: Option<Arc<dyn Redactor>>,
    summarizer: Option<Arc<dyn Summarize>>,
    catalog: Option<ModelCatalog>,
    sink: Option<Arc<dyn EventSink>>,
}

impl OrchestratorBuilder {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            tokenizers: None,
            handle_store: None,
            redactor: None,
            summarizer: None,
            catalog: None,
            sink: None,
        }
    }

    pub fn tokenizers(mut self, registry: Arc<TokenizerRegistry>) -> Self {
        self.tokenizers = Some(registry);
        self
    }

    pub fn handle_store(mut self, store: Arc<dyn HandleStore>) -> Self {
        self.handle_store = Some(store);
        self
    }

    pub fn redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactor = Some(redactor);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarize>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let accountant = TokenAccountant::new(
            self.tokenizers.unwrap_or_default(),
            config.accountant.clone(),
        );
        let store = self
            .handle_store
            .unwrap_or_else(|| Arc::new(InMemoryHandleStore::default()));
        let sanitizer = Sanitizer::new(accountant.clone(), store, config.sanitizer.clone());
        let redactor = self
            .redactor
            .unwrap_or_else(|| Arc::new(Pruner::new(config.pruner.clone())));
        let compactor = self
            .summarizer
            .map(|s| Compactor::new(accountant.clone(), s, config.compaction.config.clone()));

        Orchestrator {
            accountant,
            sanitizer,
            redactor,
            compactor,
            catalog: self.catalog.unwrap_or_else(ModelCatalog::builtin),
            sink: self.sink.unwrap_or_else(|| Arc::new(LoggingSink)),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capabilities::{CapabilityFuture, FnTokenCounter};
    use crate::config::{OrchestratorConfig, RedactionConfig, Toggle};
    use crate::context::{CompactorConfig, SanitizerConfig};
    use crate::error::CapabilityError;
    use crate::pipeline::events::CollectingSink;
    use crate::prune::{PruneOptions, PruneResponse, RecoverRequest, RedactFuture};

    fn registry() -> Arc<TokenizerRegistry> {
        Arc::new(TokenizerRegistry::new().with(
            "acme",
            Arc::new(FnTokenCounter::new(|t: &str| t.split_whitespace().count())),
        ))
    }

    fn catalog() -> ModelCatalog {
        ModelCatalog::new()
            .with_model(ModelSpec::new("small", "acme", 1_000))
            .with_model(ModelSpec::new("big", "acme", 4_000))
            .with_model(ModelSpec::new("huge", "acme", 16_000))
    }

    fn words(n: usize) -> String {
        vec!["w"; n].join(" ")
    }

    /// `lines` distinct lines of six words each.
    fn log_lines(tag: &str, lines: usize) -> String {
        (0..lines)
            .map(|i| format!("{tag} record {i} processed alpha beta"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    struct Canned;
    impl Summarize for Canned {
        fn summarize<'a>(&'a self, _text: &'a str, _max: usize) -> CapabilityFuture<'a, String> {
            Box::pin(async { Ok("earlier work on the parser".to_string()) })
        }
    }

    struct Broken;
    impl Summarize for Broken {
        fn summarize<'a>(&'a self, _text: &'a str, _max: usize) -> CapabilityFuture<'a, String> {
            Box::pin(async { Err(CapabilityError::Unavailable("offline".into())) })
        }
    }

    /// Redactor that never answers in time.
    struct Stalled;
    impl Redactor for Stalled {
        fn prune<'a>(&'a self, _request: PruneRequest) -> RedactFuture<'a, PruneResponse> {
            Box::pin(std::future::pending::<PruneResponse>())
        }
        fn recover<'a>(&'a self, request: RecoverRequest) -> RedactFuture<'a, Result<String>> {
            Box::pin(async move { Err(GateError::RecordNotFound(request.prune_id)) })
        }
    }

    fn config() -> GateConfig {
        GateConfig::default()
            .with_orchestrator(OrchestratorConfig {
                prefer_fallback: true,
                default_reserved: 0,
            })
            .with_redaction(Toggle::enabled(RedactionConfig {
                min_message_tokens: 50,
                ..RedactionConfig::default()
            }))
    }

    fn builder(config: GateConfig, sink: Arc<CollectingSink>) -> OrchestratorBuilder {
        Orchestrator::builder(config)
            .tokenizers(registry())
            .catalog(catalog())
            .sink(sink)
    }

    #[test]
    fn transition_table() {
        use Signal::*;
        use State::*;
        assert_eq!(transition(Start, Fits), Account);
        assert_eq!(transition(Account, Fits), Done);
        assert_eq!(transition(Account, OverBudget), Sanitize);
        assert_eq!(transition(Sanitize, Fits), Done);
        assert_eq!(transition(Sanitize, FallbackRequested), Account);
        assert_eq!(transition(Sanitize, OverBudget), Redact);
        assert_eq!(transition(Redact, Fits), Done);
        assert_eq!(transition(Redact, FallbackRequested), Account);
        assert_eq!(transition(Redact, OverBudget), Compact);
        assert_eq!(transition(Compact, OverBudget), Done);
        assert_eq!(transition(Done, OverBudget), Done);
    }

    #[tokio::test]
    async fn fitting_conversation_passes_through() {
        let sink = Arc::new(CollectingSink::new());
        let orch = builder(config(), sink.clone()).build();
        let messages = vec![Message::system("be brief"), Message::user("hello there")];
        let out = orch
            .run(PipelineRequest::new("s1", "small", messages.clone()))
            .await
            .unwrap();
        assert!(out.fits);
        assert_eq!(out.stages(), vec![Stage::Account, Stage::Done]);
        assert_eq!(out.conversation[1].content, messages[1].content);
        assert_eq!(out.conversation[1].sequence_index, 1);
        assert_eq!(sink.events(), out.events);
    }

    #[tokio::test]
    async fn missing_tokenizer_aborts_after_reporting() {
        let sink = Arc::new(CollectingSink::new());
        let orch = Orchestrator::builder(config())
            .catalog(catalog())
            .sink(sink.clone())
            .build();
        let err = orch
            .run(PipelineRequest::new("s1", "small", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::TokenizerUnavailable { .. }));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Degraded);
        assert_eq!(events[0].warnings[0].code, "tokenizer_unavailable");
    }

    #[tokio::test]
    async fn unknown_model_needs_explicit_limit_and_family() {
        let sink = Arc::new(CollectingSink::new());
        let orch = builder(config(), sink).build();
        let err = orch
            .run(PipelineRequest::new("s1", "mystery", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UnknownModel(_)));

        let out = orch
            .run(
                PipelineRequest::new("s1", "mystery", vec![Message::user("hi")])
                    .with_limit(100)
                    .with_family("acme"),
            )
            .await
            .unwrap();
        assert!(out.fits);
        assert_eq!(out.limit, 100);
    }

    #[tokio::test]
    async fn masking_alone_can_fit() {
        let sink = Arc::new(CollectingSink::new());
        let sanitizer = SanitizerConfig::default().with_mask_threshold(200);
        let cfg = config().with_sanitizer(sanitizer);
        let orch = builder(cfg, sink).build();
        let out = orch
            .run(PipelineRequest::new(
                "s1",
                "small",
                vec![
                    Message::user("run the tests"),
                    Message::tool_result("c1", words(1200)),
                ],
            ))
            .await
            .unwrap();
        assert!(out.fits);
        assert_eq!(
            out.stages(),
            vec![Stage::Account, Stage::Sanitize, Stage::Done]
        );
        assert_eq!(out.events[1].outcome, Outcome::Reduced);
        assert_eq!(out.handles.len(), 1);
        assert!(is_masked(&out.conversation[1]));
        assert_eq!(out.model, "small");
    }

    #[tokio::test]
    async fn fallback_restarts_accounting_once() {
        let sink = Arc::new(CollectingSink::new());
        let orch = builder(config(), sink).build();
        let out = orch
            .run(PipelineRequest::new("s1", "small", vec![Message::user(words(1500))]))
            .await
            .unwrap();
        assert!(out.fits);
        assert_eq!(
            out.stages(),
            vec![
                Stage::Account,
                Stage::Sanitize,
                Stage::Fallback,
                Stage::Account,
                Stage::Done,
            ]
        );
        assert_eq!(out.model, "big");
        assert_eq!(out.limit, 4_000);
        assert_eq!(out.fallback_from.as_deref(), Some("small"));
        assert_eq!(out.events[2].event_type(), "fallback_event");
        assert_eq!(out.conversation[0].content, words(1500));
    }

    #[tokio::test]
    async fn at_most_one_fallback_per_run() {
        let sink = Arc::new(CollectingSink::new());
        let cfg = config().with_compaction(Toggle::disabled());
        let orch = builder(cfg, sink).build();
        // Larger than every model, and a single line the redactor can't touch.
        let out = orch
            .run(PipelineRequest::new("s1", "small", vec![Message::user(words(20_000))]))
            .await
            .unwrap();
        let stages = out.stages();
        let fallbacks = stages.iter().filter(|s| **s == Stage::Fallback).count();
        assert_eq!(fallbacks, 1);
        assert_eq!(out.model, "huge");
        assert!(!out.fits);
        let last = out.events.last().unwrap();
        assert_eq!(last.outcome, Outcome::OverBudget);
        assert_eq!(last.event_type(), "over_budget_event");
    }

    #[tokio::test]
    async fn redaction_first_when_fallback_not_preferred() {
        let sink = Arc::new(CollectingSink::new());
        let cfg = config().with_orchestrator(OrchestratorConfig {
            prefer_fallback: false,
            default_reserved: 0,
        });
        let orch = builder(cfg, sink).build();
        // 200 lines x 6 words = 1200 tokens against a 1000 limit.
        let out = orch
            .run(PipelineRequest::new(
                "s1",
                "small",
                vec![
                    Message::user("look at deployment"),
                    Message::assistant(log_lines("job", 200)),
                ],
            ))
            .await
            .unwrap();
        assert!(out.fits, "{:?}", out.budget);
        assert_eq!(
            out.stages(),
            vec![
                Stage::Account,
                Stage::Sanitize,
                Stage::Redact,
                Stage::Done,
            ]
        );
        assert_eq!(out.model, "small");
        assert_eq!(out.prune_ids.len(), 1);
        assert_eq!(out.events[2].outcome, Outcome::Reduced);
    }

    #[tokio::test]
    async fn deferred_fallback_taken_when_redaction_falls_short() {
        let sink = Arc::new(CollectingSink::new());
        let cfg = config()
            .with_orchestrator(OrchestratorConfig {
                prefer_fallback: false,
                default_reserved: 0,
            })
            .with_compaction(Toggle::disabled());
        let orch = builder(cfg, sink).build();
        // 600 lines x 6 words; redaction halves it at best, still over 1000.
        let out = orch
            .run(PipelineRequest::new(
                "s1",
                "small",
                vec![
                    Message::user("look at deployment"),
                    Message::assistant(log_lines("job", 600)),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(
            &out.stages()[..4],
            &[
                Stage::Account,
                Stage::Sanitize,
                Stage::Redact,
                Stage::Fallback,
            ]
        );
        assert_eq!(out.model, "big");
        assert!(out.fits);
    }

    #[tokio::test]
    async fn redactor_timeout_degrades_then_compacts() {
        let sink = Arc::new(CollectingSink::new());
        let mut cfg = config().with_compaction(Toggle::enabled(
            CompactorConfig::default().with_preserve_count(1),
        ));
        let timeout = Duration::from_millis(10);
        cfg.redaction.config.options = PruneOptions::default().with_timeout(timeout);
        cfg.redaction.config.call_grace = timeout;
        let orch = builder(cfg, sink)
            .catalog(ModelCatalog::new().with_model(ModelSpec::new("small", "acme", 1_000)))
            .redactor(Arc::new(Stalled))
            .summarizer(Arc::new(Canned))
            .build();
        let out = orch
            .run(PipelineRequest::new(
                "s1",
                "small",
                vec![
                    Message::system("rules"),
                    Message::user("first task"),
                    Message::assistant(words(700)),
                    Message::user("second task"),
                    Message::assistant(words(400)),
                ],
            ))
            .await
            .unwrap();
        let redact = &out.events[2];
        assert_eq!(redact.stage, Stage::Redact);
        assert_eq!(redact.outcome, Outcome::Degraded);
        assert_eq!(redact.warnings[0].code, "timeout");

        let compact = &out.events[3];
        assert_eq!(compact.stage, Stage::Compact);
        assert_eq!(compact.outcome, Outcome::Reduced);
        assert!(out.fits);
        assert!(out.conversation[0].is_system());
        assert!(out.conversation[1].content.starts_with(SUMMARY_PREFIX));
        assert_eq!(out.conversation[2].content, "second task");
    }

    #[tokio::test]
    async fn failed_summary_leaves_conversation_and_reports_over_budget() {
        let sink = Arc::new(CollectingSink::new());
        let cfg = config().with_redaction(Toggle::disabled());
        let orch = builder(cfg, sink.clone())
            .catalog(ModelCatalog::new().with_model(ModelSpec::new("small", "acme", 1_000)))
            .summarizer(Arc::new(Broken))
            .build();
        let messages = vec![
            Message::user("a"),
            Message::assistant(words(600)),
            Message::user("b"),
            Message::assistant(words(300)),
            Message::user("c"),
            Message::assistant(words(300)),
        ];
        let out = orch
            .run(PipelineRequest::new("s1", "small", messages.clone()))
            .await
            .unwrap();
        assert!(!out.fits);
        assert_eq!(out.conversation.len(), messages.len());
        let stages = out.stages();
        assert_eq!(
            stages,
            vec![
                Stage::Account,
                Stage::Sanitize,
                Stage::Redact,
                Stage::Compact,
                Stage::Done,
            ]
        );
        assert_eq!(out.events[2].outcome, Outcome::Skipped);
        assert_eq!(out.events[3].outcome, Outcome::Degraded);
        assert_eq!(out.events[3].warnings[0].code, "summarizer_failed");
        let last = sink.events().last().cloned().unwrap();
        assert_eq!(last.event_type(), "over_budget_event");
    }

    #[tokio::test]
    async fn compaction_skipped_without_summarizer() {
        let sink = Arc::new(CollectingSink::new());
        let orch = builder(config().with_redaction(Toggle::disabled()), sink)
            .catalog(ModelCatalog::new().with_model(ModelSpec::new("small", "acme", 1_000)))
            .build();
        let out = orch
            .run(PipelineRequest::new("s1", "small", vec![Message::user(words(1200))]))
            .await
            .unwrap();
        let compact = &out.events[3];
        assert_eq!(compact.outcome, Outcome::Skipped);
        assert_eq!(compact.detail["reason"], "no_summarizer");
        assert!(!out.fits);
    }

    #[test]
    fn goal_hint_skips_summaries() {
        let conversation = vec![
            Message::user("fix the flaky upload test"),
            Message::user(format!("{SUMMARY_PREFIX} 3 earlier messages]\nstuff")),
        ];
        let hint = Orchestrator::goal_hint(&conversation);
        assert_eq!(hint, "fix the flaky upload test");
    }
}
