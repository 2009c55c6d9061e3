pub mod config;
pub mod convert;
pub mod import;
pub mod rules;
pub mod run;
pub mod serve;
