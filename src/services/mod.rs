//! Service layer: the persistence contract and its backends, plus metrics.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::Database;
pub use memory::MemoryStore;
pub use metrics::init_metrics;
pub use store::{CandidateQuery, Store};
