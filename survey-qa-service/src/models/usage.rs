//! Usage tracking model for token consumption and cost.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Accumulated usage for one `(call_id, model_id)` pair.
///
/// `total_tokens` is kept equal to `prompt_tokens + completion_tokens`; the
/// fields are only mutated through [`UsageRecord::add_prompt`] and
/// [`UsageRecord::add_completion`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Total tokens (prompt + completion).
    pub total_tokens: u64,

    /// Prompt tokens sent to the model.
    pub prompt_tokens: u64,

    /// Completion tokens received from the model.
    pub completion_tokens: u64,

    /// Number of prompt-accounting events.
    pub successful_requests: u64,

    /// Accumulated cost in USD.
    pub total_cost: f64,
}

impl UsageRecord {
    /// Record one prompt-accounting event.
    pub fn add_prompt(&mut self, tokens: u64, cost: f64) {
        self.prompt_tokens += tokens;
        self.total_tokens += tokens;
        self.successful_requests += 1;
        self.total_cost += cost;
    }

    /// Record completion tokens.
    pub fn add_completion(&mut self, tokens: u64, cost: f64) {
        self.completion_tokens += tokens;
        self.total_tokens += tokens;
        self.total_cost += cost;
    }
}

/// Usage of one call, keyed by model id.
pub type CallUsage = HashMap<String, UsageRecord>;

/// Prompt/completion split reported per model in API responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetail {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Aggregated usage for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    /// Total tokens across all models.
    pub total_tokens: u64,

    /// Total cost across all models.
    pub total_cost: f64,

    /// Usage by model.
    pub by_model: BTreeMap<String, UsageRecord>,
}

impl UsageSummary {
    /// Aggregate a call's per-model records.
    pub fn from_call(usage: &CallUsage) -> Self {
        let mut summary = UsageSummary::default();

        for (model, record) in usage {
            summary.total_tokens += record.total_tokens;
            summary.total_cost += record.total_cost;
            summary.by_model.insert(model.clone(), record.clone());
        }

        summary
    }

    pub fn token_details(&self) -> BTreeMap<String, TokenDetail> {
        self.by_model
            .iter()
            .map(|(model, record)| {
                (
                    model.clone(),
                    TokenDetail {
                        prompt_tokens: record.prompt_tokens,
                        completion_tokens: record.completion_tokens,
                    },
                )
            })
            .collect()
    }
}
