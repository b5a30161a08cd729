//! Per-request isolation and timeout harness.
//!
//! Each run gets a fresh call id registered in the usage store, a metered
//! client bound to it, and a collaborator executing on the blocking pool under
//! a timeout. The call's usage entry is removed on every exit path.

use crate::metering::{MeteredClient, PricingError, PricingTable, UsageStore};
use crate::models::{RunResponse, UsageSummary};
use crate::services::collaborator::CollaboratorFactory;
use crate::services::metrics;
use crate::services::providers::ChatModel;
use chrono::Utc;
use rand::Rng;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Span};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{0:#}")]
    Collaborator(anyhow::Error),

    #[error("collaborator panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Pricing(#[from] PricingError),
}

/// What a run produced. `result` and `elapsed` are absent when it timed out.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub call_id: String,
    pub result: Option<String>,
    pub elapsed: Option<Duration>,
    pub timed_out: bool,
    pub usage: UsageSummary,
}

impl From<RunReport> for RunResponse {
    fn from(report: RunReport) -> Self {
        Self {
            result: report.result,
            time: report.elapsed.map(|d| d.as_secs_f64()),
            timed_out: report.timed_out,
            tokens: report.usage.total_tokens,
            cost: report.usage.total_cost,
            token_details: report.usage.token_details(),
        }
    }
}

/// Timestamp to the microsecond plus a random suffix.
pub fn mint_call_id() -> String {
    format!(
        "{}_{}",
        Utc::now().format("%Y%m%d%H%M%S%6f"),
        rand::thread_rng().gen_range(0..=1_000_000)
    )
}

/// Owns a registered call id. Dropping it cancels the call and removes its
/// usage entry, including when the request future is dropped mid-await.
struct CallGuard {
    store: UsageStore,
    call_id: String,
    cancel: CancellationToken,
}

impl CallGuard {
    fn new(store: UsageStore, call_id: String) -> Self {
        metrics::inc_runs_in_flight();
        Self {
            store,
            call_id,
            cancel: CancellationToken::new(),
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.store.close(&self.call_id);
        metrics::dec_runs_in_flight();
        tracing::debug!(call_id = %self.call_id, "Call cleaned up");
    }
}

pub struct RequestHarness {
    store: UsageStore,
    pricing: PricingTable,
    model: Arc<dyn ChatModel>,
    factory: Arc<dyn CollaboratorFactory>,
}

impl RequestHarness {
    pub fn new(
        store: UsageStore,
        pricing: PricingTable,
        model: Arc<dyn ChatModel>,
        factory: Arc<dyn CollaboratorFactory>,
    ) -> Self {
        Self {
            store,
            pricing,
            model,
            factory,
        }
    }

    pub fn store(&self) -> &UsageStore {
        &self.store
    }

    fn register_call(&self) -> String {
        loop {
            let call_id = mint_call_id();
            if self.store.open(&call_id) {
                return call_id;
            }
            tracing::warn!(call_id = %call_id, "Call id collision, minting another");
        }
    }

    /// Run the collaborator on `prompt`, giving up after `timeout`.
    ///
    /// A timeout is not an error: the report carries `timed_out` and whatever
    /// usage was recorded before it fired.
    #[instrument(skip(self, prompt), fields(call_id = tracing::field::Empty, timeout_secs = timeout.as_secs()))]
    pub async fn run(&self, prompt: String, timeout: Duration) -> Result<RunReport, HarnessError> {
        let call_id = self.register_call();
        Span::current().record("call_id", call_id.as_str());

        let guard = CallGuard::new(self.store.clone(), call_id.clone());

        let llm = MeteredClient::new(
            self.model.clone(),
            call_id.clone(),
            self.store.clone(),
            self.pricing.clone(),
        )?
        .with_cancellation(guard.cancel.clone());

        let collaborator = self.factory.create(llm);
        let started = Instant::now();

        tracing::info!(model_id = %self.model.model_id(), "Run started");

        let worker = tokio::task::spawn_blocking(move || collaborator.run(&prompt));
        let outcome = tokio::time::timeout(timeout, worker).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(Ok(answer))) => {
                let usage = self.store.summary(&call_id);
                metrics::record_run("completed", elapsed.as_secs_f64());
                tracing::info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    tokens = usage.total_tokens,
                    cost = usage.total_cost,
                    "Run completed"
                );
                Ok(RunReport {
                    call_id,
                    result: Some(answer),
                    elapsed: Some(elapsed),
                    timed_out: false,
                    usage,
                })
            }
            Ok(Ok(Err(e))) => {
                metrics::record_run("failed", elapsed.as_secs_f64());
                tracing::error!(error = %format!("{:#}", e), "Run failed");
                Err(HarnessError::Collaborator(e))
            }
            Ok(Err(join_error)) => {
                metrics::record_run("failed", elapsed.as_secs_f64());
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                tracing::error!(error = %message, "Run worker panicked");
                Err(HarnessError::Panicked(message))
            }
            Err(_) => {
                guard.cancel.cancel();
                let usage = self.store.summary(&call_id);
                metrics::record_run("timed_out", elapsed.as_secs_f64());
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    tokens = usage.total_tokens,
                    "Run timed out"
                );
                Ok(RunReport {
                    call_id,
                    result: None,
                    elapsed: None,
                    timed_out: true,
                    usage,
                })
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PromptInput;
    use crate::services::collaborator::Collaborator;
    use crate::services::providers::mock::MockChatModel;

    const HAIKU: &str = "anthropic.claude-3-haiku-20240307-v1:0";

    /// Sends the prompt to the model once and returns its reply.
    struct Echo {
        llm: MeteredClient,
    }

    impl Collaborator for Echo {
        fn run(&self, prompt: &str) -> anyhow::Result<String> {
            let response = self.llm.invoke(&PromptInput::text(prompt))?;
            Ok(response.as_text().unwrap_or_default().to_string())
        }
    }

    /// Calls the model once, then waits until cancelled (or ten seconds).
    struct Sleeper {
        llm: MeteredClient,
    }

    impl Collaborator for Sleeper {
        fn run(&self, prompt: &str) -> anyhow::Result<String> {
            self.llm.invoke(&PromptInput::text(prompt))?;
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                if self.llm.is_cancelled() {
                    anyhow::bail!("cancelled");
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok("too late".to_string())
        }
    }

    struct Failing;

    impl Collaborator for Failing {
        fn run(&self, _prompt: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("database unreachable"))
        }
    }

    struct Panicking;

    impl Collaborator for Panicking {
        fn run(&self, _prompt: &str) -> anyhow::Result<String> {
            panic!("collaborator exploded")
        }
    }

    fn harness(
        model: MockChatModel,
        factory: impl Fn(MeteredClient) -> Box<dyn Collaborator> + Send + Sync + 'static,
    ) -> RequestHarness {
        RequestHarness::new(
            UsageStore::new(),
            PricingTable::builtin(),
            Arc::new(model),
            Arc::new(factory),
        )
    }

    #[test]
    fn call_ids_have_timestamp_and_random_suffix() {
        let id = mint_call_id();
        let (timestamp, suffix) = id.split_once('_').unwrap();

        assert_eq!(timestamp.len(), 20);
        assert!(timestamp.chars().all(|c| c.is_ascii_digit()));
        assert!(suffix.parse::<u32>().unwrap() <= 1_000_000);
    }

    #[tokio::test]
    async fn successful_run_reports_usage_and_cleans_up() {
        let harness = harness(MockChatModel::new(HAIKU).with_reply("forty two"), |llm| {
            Box::new(Echo { llm })
        });

        let report = harness
            .run("how many students".to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.result.as_deref(), Some("forty two"));
        assert!(!report.timed_out);
        assert!(report.elapsed.is_some());
        assert_eq!(report.usage.total_tokens, 5);
        let detail = report.usage.token_details()[HAIKU];
        assert_eq!(detail.prompt_tokens, 3);
        assert_eq!(detail.completion_tokens, 2);
        assert!(!harness.store().is_open(&report.call_id));
        assert!(harness.store().is_empty());
    }

    #[tokio::test]
    async fn timeout_returns_partial_usage_and_cancels() {
        let harness = harness(MockChatModel::new(HAIKU).with_reply("ok"), |llm| {
            Box::new(Sleeper { llm })
        });
        let started = Instant::now();

        let report = harness
            .run("a b c d".to_string(), Duration::from_millis(300))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(report.timed_out);
        assert!(report.result.is_none());
        assert!(report.elapsed.is_none());
        assert_eq!(report.usage.total_tokens, 5);
        assert!(harness.store().is_empty());
    }

    #[tokio::test]
    async fn collaborator_error_propagates_and_cleans_up() {
        let harness = harness(MockChatModel::new(HAIKU), |_| Box::new(Failing));

        let err = harness
            .run("q".to_string(), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Collaborator(_)));
        assert_eq!(err.to_string(), "database unreachable");
        assert!(harness.store().is_empty());
    }

    #[tokio::test]
    async fn collaborator_panic_is_reported() {
        let harness = harness(MockChatModel::new(HAIKU), |_| Box::new(Panicking));

        let err = harness
            .run("q".to_string(), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Panicked(msg) if msg == "collaborator exploded"));
        assert!(harness.store().is_empty());
    }

    #[tokio::test]
    async fn unpriced_model_fails_before_running() {
        let harness = harness(MockChatModel::new("vendor.unpriced-v1"), |_| {
            Box::new(Failing)
        });

        let err = harness
            .run("q".to_string(), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Pricing(PricingError::UnknownModel(_))));
        assert!(harness.store().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_are_isolated() {
        let harness = Arc::new(harness(
            MockChatModel::new(HAIKU).with_delay(Duration::from_millis(100)),
            |llm| Box::new(Echo { llm }),
        ));

        let short = {
            let harness = harness.clone();
            tokio::spawn(async move { harness.run("a b c".to_string(), Duration::from_secs(5)).await })
        };
        let long = {
            let harness = harness.clone();
            tokio::spawn(async move {
                harness
                    .run("a b c d e".to_string(), Duration::from_secs(5))
                    .await
            })
        };

        let short = short.await.unwrap().unwrap();
        let long = long.await.unwrap().unwrap();

        assert_ne!(short.call_id, long.call_id);
        // Prompt words plus "Mock response for: <prompt>".
        assert_eq!(short.usage.total_tokens, 3 + 6);
        assert_eq!(long.usage.total_tokens, 5 + 8);
        assert_eq!(short.usage.by_model[HAIKU].successful_requests, 1);
        assert_eq!(long.usage.by_model[HAIKU].successful_requests, 1);
        assert!(harness.store().is_empty());
    }

    #[test]
    fn report_converts_to_response_body() {
        let mut usage = crate::models::CallUsage::new();
        usage
            .entry(HAIKU.to_string())
            .or_default()
            .add_prompt(10, 0.0025);
        let report = RunReport {
            call_id: "x".to_string(),
            result: None,
            elapsed: None,
            timed_out: true,
            usage: UsageSummary::from_call(&usage),
        };

        let body = serde_json::to_value(RunResponse::from(report)).unwrap();

        assert_eq!(body["result"], serde_json::Value::Null);
        assert_eq!(body["time"], serde_json::Value::Null);
        assert_eq!(body["timed_out"], true);
        assert_eq!(body["tokens"], 10);
        assert_eq!(body["token_details"][HAIKU]["prompt_tokens"], 10);
    }
}
