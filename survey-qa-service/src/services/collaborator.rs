//! The answer producer the harness delegates to.

use crate::metering::MeteredClient;

/// Turns a prompt into an answer. Runs on a blocking worker thread and may
/// block for as long as it needs; the harness bounds it with a timeout.
pub trait Collaborator: Send {
    fn run(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Builds one collaborator per request, bound to that request's metered client.
pub trait CollaboratorFactory: Send + Sync {
    fn create(&self, llm: MeteredClient) -> Box<dyn Collaborator>;
}

impl<F> CollaboratorFactory for F
where
    F: Fn(MeteredClient) -> Box<dyn Collaborator> + Send + Sync,
{
    fn create(&self, llm: MeteredClient) -> Box<dyn Collaborator> {
        self(llm)
    }
}
