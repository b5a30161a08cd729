//! Per-call usage table.

use crate::models::{CallUsage, UsageRecord, UsageSummary};
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent table of usage keyed by call id, then model id.
///
/// A call id must be registered with [`UsageStore::open`] before anything is
/// recorded against it. Writes against an id that is not registered (never
/// opened, or already closed) are dropped, so a worker that outlives its
/// request can never resurrect a removed entry. Per-model records are created
/// lazily on the first accounting event.
#[derive(Debug, Clone, Default)]
pub struct UsageStore {
    calls: Arc<DashMap<String, CallUsage>>,
}

impl UsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call id with an empty model map. Returns `false` if the id
    /// is already registered.
    pub fn open(&self, call_id: &str) -> bool {
        match self.calls.entry(call_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(CallUsage::new());
                true
            }
        }
    }

    pub fn is_open(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    /// Record one prompt-accounting event. Returns whether the write landed.
    pub fn record_prompt(&self, call_id: &str, model_id: &str, tokens: u64, cost: f64) -> bool {
        self.update(call_id, model_id, |record| record.add_prompt(tokens, cost))
    }

    /// Record completion tokens. Returns whether the write landed.
    pub fn record_completion(&self, call_id: &str, model_id: &str, tokens: u64, cost: f64) -> bool {
        self.update(call_id, model_id, |record| record.add_completion(tokens, cost))
    }

    fn update(&self, call_id: &str, model_id: &str, apply: impl FnOnce(&mut UsageRecord)) -> bool {
        match self.calls.get_mut(call_id) {
            Some(mut usage) => {
                apply(usage.entry(model_id.to_string()).or_default());
                true
            }
            None => {
                tracing::debug!(
                    call_id = %call_id,
                    model_id = %model_id,
                    "Dropping usage for unregistered call"
                );
                false
            }
        }
    }

    /// Current record for one model of a call.
    pub fn record(&self, call_id: &str, model_id: &str) -> Option<UsageRecord> {
        self.calls
            .get(call_id)
            .and_then(|usage| usage.get(model_id).cloned())
    }

    /// Aggregate usage of a call; empty when the call is unknown.
    pub fn summary(&self, call_id: &str) -> UsageSummary {
        self.calls
            .get(call_id)
            .map(|usage| UsageSummary::from_call(&usage))
            .unwrap_or_default()
    }

    /// Remove a call and everything recorded against it.
    pub fn close(&self, call_id: &str) -> Option<UsageSummary> {
        self.calls
            .remove(call_id)
            .map(|(_, usage)| UsageSummary::from_call(&usage))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
