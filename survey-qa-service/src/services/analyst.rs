//! Survey analyst: answers questions about the PIRLS data by letting the
//! model call database tools in a bounded loop.

use crate::metering::MeteredClient;
use crate::models::{ContentPart, Message, MessageContent, PromptInput};
use crate::services::collaborator::{Collaborator, CollaboratorFactory};
use crate::services::survey_db::{SurveyTable, SurveyTools};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_MAX_ITERATIONS: usize = 5;

const SYSTEM_PROMPT: &str = r#"You are a senior data engineer with a lot of experience working with the PIRLS reading literacy survey data, stored in a PostgreSQL database.

There is a table 'Students' with columns Student_ID and Country_ID, and a table 'Countries' with columns Country_ID, Name and Code. Questionnaires exist for Students, Curricula, Homes, Teachers and Schools, each with a <Subject>QuestionnaireAnswers and a <Subject>QuestionnaireEntries table.

To use a tool, reply with exactly one fenced JSON block and nothing else:

```json
{"tool": "query_database", "query": "SELECT ..."}
```

Available tools:
- {"tool": "query_database", "query": string}: run a read-only SQL query.
- {"tool": "possible_answers", "table": "Students"|"Curricula"|"Homes"|"Teachers"|"Schools", "question_code": string}: list the possible answers to a questionnaire question.
- {"tool": "questions_of_type", "table": "Students"|"Curricula"|"Homes"|"Teachers"|"Schools", "question_type": string}: list questions of a given type with their codes.

Each tool result is sent back to you. When you know the answer, reply with the answer in plain text and no JSON block."#;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    QueryDatabase {
        query: String,
    },
    PossibleAnswers {
        table: SurveyTable,
        question_code: String,
    },
    QuestionsOfType {
        table: SurveyTable,
        question_type: String,
    },
}

impl ToolCall {
    fn name(&self) -> &'static str {
        match self {
            ToolCall::QueryDatabase { .. } => "query_database",
            ToolCall::PossibleAnswers { .. } => "possible_answers",
            ToolCall::QuestionsOfType { .. } => "questions_of_type",
        }
    }
}

/// Extract the body of the first ```json fence, if the reply has one.
fn json_fence(reply: &str) -> Option<&str> {
    let start = reply.find("```json")? + "```json".len();
    let rest = &reply[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// `None` when the reply is a final answer.
pub fn parse_tool_call(reply: &str) -> Option<Result<ToolCall, serde_json::Error>> {
    json_fence(reply).map(serde_json::from_str)
}

pub struct SurveyAnalyst {
    llm: MeteredClient,
    tools: Arc<dyn SurveyTools>,
    max_iterations: usize,
}

impl SurveyAnalyst {
    pub fn new(llm: MeteredClient, tools: Arc<dyn SurveyTools>, max_iterations: usize) -> Self {
        Self {
            llm,
            tools,
            max_iterations,
        }
    }

    fn execute(&self, call: &ToolCall) -> String {
        match call {
            ToolCall::QueryDatabase { query } => self.tools.query_database(query),
            ToolCall::PossibleAnswers {
                table,
                question_code,
            } => self.tools.possible_answers(*table, question_code),
            ToolCall::QuestionsOfType {
                table,
                question_type,
            } => self.tools.questions_of_type(*table, question_type),
        }
    }
}

impl Collaborator for SurveyAnalyst {
    fn run(&self, prompt: &str) -> anyhow::Result<String> {
        let mut messages = vec![Message::user(format!(
            "Query the database and answer the question \"{}\".",
            prompt
        ))];

        for iteration in 1..=self.max_iterations {
            if self.llm.is_cancelled() {
                bail!("run cancelled after {} iterations", iteration - 1);
            }

            let input = PromptInput::default()
                .with_system(SYSTEM_PROMPT)
                .with_messages(messages.clone());

            let response = self
                .llm
                .invoke(&input)
                .with_context(|| format!("model invocation failed on iteration {}", iteration))?;

            let Some(reply) = response.as_text().map(str::to_string) else {
                bail!("model returned a non-text response on iteration {}", iteration);
            };

            let (input_value, output) = match parse_tool_call(&reply) {
                None => {
                    tracing::info!(
                        call_id = %self.llm.call_id(),
                        iterations = iteration,
                        "Analyst produced an answer"
                    );
                    return Ok(reply.trim().to_string());
                }
                Some(Ok(call)) => {
                    tracing::debug!(
                        call_id = %self.llm.call_id(),
                        tool = call.name(),
                        iteration = iteration,
                        "Running analyst tool"
                    );
                    let output = self.execute(&call);
                    let input = serde_json::to_value(&call).unwrap_or(Value::Null);
                    (input, output)
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, iteration = iteration, "Malformed tool call");
                    (
                        Value::String(json_fence(&reply).unwrap_or_default().to_string()),
                        format!("Invalid tool call: {}", e),
                    )
                }
            };

            messages.push(Message::assistant(reply));
            messages.push(Message::user(MessageContent::Parts(vec![
                ContentPart::exchange(input_value, output),
            ])));
        }

        bail!(
            "no answer after {} iterations",
            self.max_iterations
        )
    }
}

/// Builds a [`SurveyAnalyst`] per request.
#[derive(Clone)]
pub struct AnalystFactory {
    tools: Arc<dyn SurveyTools>,
    max_iterations: usize,
}

impl AnalystFactory {
    pub fn new(tools: Arc<dyn SurveyTools>, max_iterations: usize) -> Self {
        Self {
            tools,
            max_iterations,
        }
    }
}

impl CollaboratorFactory for AnalystFactory {
    fn create(&self, llm: MeteredClient) -> Box<dyn Collaborator> {
        Box::new(SurveyAnalyst::new(
            llm,
            self.tools.clone(),
            self.max_iterations,
        ))
    }
}
