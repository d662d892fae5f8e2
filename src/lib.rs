//! Mailsift — adaptive tiered email classification.

pub mod classifier;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod learning;
pub mod llm;
pub mod review;
pub mod router;
pub mod rules;
pub mod store;
pub mod telemetry;
pub mod types;
