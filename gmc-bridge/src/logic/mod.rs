pub mod client;
pub mod config;
pub mod serve;
pub mod topic;
pub mod types;
pub mod validation;
