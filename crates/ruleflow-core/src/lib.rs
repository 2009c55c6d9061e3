pub mod accessor;
pub mod actions;
pub mod client;
pub mod config;
pub mod context;
pub mod converter;
pub mod engine;
pub mod error;
pub mod guard;
pub mod io;
pub mod orchestrator;
pub mod review;
pub mod rule;
pub mod script;
pub mod session;
pub mod store;

pub use error::{Result, RuleflowError};
