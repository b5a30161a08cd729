//! HTTP handlers for the survey QA service.

pub mod health;
pub mod metrics;
pub mod run;
