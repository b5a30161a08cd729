pub mod analyst;
pub mod collaborator;
pub mod harness;
pub mod metrics;
pub mod providers;
pub mod survey_db;

pub use analyst::{AnalystFactory, SurveyAnalyst};
pub use collaborator::{Collaborator, CollaboratorFactory};
pub use harness::{HarnessError, RequestHarness, RunReport};
pub use survey_db::{PgSurveyTools, SurveyDb, SurveyTable, SurveyTools};
