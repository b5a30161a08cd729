//! Per-model token prices.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PricingError {
    /// The model has no registered price. This is a configuration bug, never a zero cost.
    #[error("no pricing registered for model '{0}'")]
    UnknownModel(String),
}

/// USD price per 1000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

/// Which side of a call is being priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    /// Priced at the input rate.
    Prompt,
    /// Priced at the output rate.
    Completion,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Prompt => "prompt",
            UsageKind::Completion => "completion",
        }
    }
}

const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    ("anthropic.claude-3-5-sonnet-20240620-v1:0", 0.003, 0.015),
    ("anthropic.claude-3-haiku-20240307-v1:0", 0.00025, 0.00125),
    ("amazon.titan-text-premier-v1:0", 0.0005, 0.0015),
    ("meta.llama3-8b-instruct-v1:0", 0.0003, 0.0006),
    ("meta.llama3-70b-instruct-v1:0", 0.00265, 0.0035),
    ("mistral.mistral-7b-instruct-v0:2", 0.00015, 0.0002),
    ("mistral.mixtral-8x7b-instruct-v0:1", 0.00045, 0.0007),
];

/// Immutable pricing table shared by every metered client.
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: Arc<HashMap<String, ModelPrice>>,
}

impl PricingTable {
    pub fn new(prices: HashMap<String, ModelPrice>) -> Self {
        Self {
            prices: Arc::new(prices),
        }
    }

    /// Bedrock on-demand prices for the models the service has been run with.
    pub fn builtin() -> Self {
        Self::new(builtin_prices())
    }

    /// Built-in prices extended (and overridden) by the entries of a JSON
    /// pricing file mapping model ids to `{ "input": .., "output": .. }`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pricing file {}", path.display()))?;
        let overrides: HashMap<String, ModelPrice> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid pricing file {}", path.display()))?;

        let mut prices = builtin_prices();
        let count = overrides.len();
        prices.extend(overrides);

        tracing::info!(
            path = %path.display(),
            entries = count,
            "Loaded model pricing overrides"
        );

        Ok(Self::new(prices))
    }

    pub fn price(&self, model_id: &str) -> Result<ModelPrice, PricingError> {
        self.prices
            .get(model_id)
            .copied()
            .ok_or_else(|| PricingError::UnknownModel(model_id.to_string()))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.prices.contains_key(model_id)
    }

    /// Cost of `tokens` tokens: `tokens / 1000 * price[kind]`.
    pub fn cost(&self, model_id: &str, tokens: u64, kind: UsageKind) -> Result<f64, PricingError> {
        let price = self.price(model_id)?;
        let per_thousand = match kind {
            UsageKind::Prompt => price.input,
            UsageKind::Completion => price.output,
        };
        Ok(tokens as f64 / 1000.0 * per_thousand)
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.prices.keys().map(String::as_str)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_prices() -> HashMap<String, ModelPrice> {
    BUILTIN_PRICES
        .iter()
        .map(|(model, input, output)| {
            (
                model.to_string(),
                ModelPrice {
                    input: *input,
                    output: *output,
                },
            )
        })
        .collect()
}
