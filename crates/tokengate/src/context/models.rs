//! Static provider/model capability table and fallback selection.

use serde::{Deserialize, Serialize};

/// One model the gateway can route to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Provider family. Also selects the tokenizer.
    pub family: String,
    /// Context window in tokens.
    pub context_limit: usize,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, family: impl Into<String>, context_limit: usize) -> Self {
        Self {
            name: name.into(),
            family: family.into(),
            context_limit,
        }
    }
}

/// Model name → family → context limit.
///
/// Plain data: callers inject it, nothing in the crate consults a global
/// table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalog {
    models: Vec<ModelSpec>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model (builder pattern). A later entry with the same name
    /// replaces the earlier one.
    pub fn with_model(mut self, spec: ModelSpec) -> Self {
        self.models.retain(|m| m.name != spec.name);
        self.models.push(spec);
        self
    }

    /// A small table of common models, for convenience.
    pub fn builtin() -> Self {
        [
            ("gpt-4o-mini", "openai", 128_000),
            ("gpt-4o", "openai", 128_000),
            ("gpt-4.1", "openai", 1_047_576),
            ("o3", "openai", 200_000),
            ("claude-haiku-4", "anthropic", 200_000),
            ("claude-sonnet-4", "anthropic", 200_000),
            ("claude-sonnet-4-1m", "anthropic", 1_000_000),
            ("gemini-2.5-flash", "google", 1_048_576),
            ("gemini-2.5-pro", "google", 1_048_576),
            ("llama-3.1-70b", "meta", 131_072),
            ("llama-4-scout", "meta", 10_000_000),
        ]
        .into_iter()
        .fold(Self::new(), |catalog, (name, family, limit)| {
            catalog.with_model(ModelSpec::new(name, family, limit))
        })
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Pick a fallback for `current` given the tokens the conversation needs.
    ///
    /// Candidates are models of the same family with a strictly larger
    /// context limit. Among those, the smallest one where
    /// `required_tokens <= limit` wins. If none is large enough the largest
    /// candidate is returned, since it still buys the most headroom. `None`
    /// when the model is unknown or already the largest in its family.
    pub fn select_fallback(&self, current: &str, required_tokens: usize) -> Option<&ModelSpec> {
        let current = self.get(current)?;
        let mut larger: Vec<&ModelSpec> = self
            .models
            .iter()
            .filter(|m| m.family == current.family && m.context_limit > current.context_limit)
            .collect();
        larger.sort_by(|a, b| {
            a.context_limit
                .cmp(&b.context_limit)
                .then_with(|| a.name.cmp(&b.name))
        });
        larger
            .iter()
            .find(|m| required_tokens <= m.context_limit)
            .or_else(|| larger.last())
            .copied()
    }
}
