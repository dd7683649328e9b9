//! Agent Queue: durable job queue and coordination engine for named agents.

pub mod agents;
pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
