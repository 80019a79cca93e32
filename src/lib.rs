//! Reconciliation core of a double-entry ledger: rule-driven matching of
//! externally sourced transactions against internal ledger records, as a
//! resumable, checkpointed batch job.

pub mod config;
pub mod error;
pub mod matcher;
pub mod models;
pub mod reconciler;
pub mod services;
