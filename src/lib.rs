//! inkflow: batch content generation over multi-stage LLM pipelines.
//!
//! A submitted [`job::Job`] fans out into one [`job::ItemTask`] per topic.
//! A deployment-wide worker pool ([`scheduler::JobQueue`]) runs each item
//! through the [`pipeline::Pipeline`] of its generator type, retrying
//! failed stages in place, while [`status::StatusReporter`] turns the
//! stored job into poll snapshots.

pub mod anthropic;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod ui;
pub mod worker;
