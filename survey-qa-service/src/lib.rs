pub mod config;
pub mod handlers;
pub mod metering;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::{build_router, AppState, Application};
