pub mod dsl;
pub mod engine;
pub mod reconcile;

pub use dsl::{QueryOptions, RequestedScope};
pub use engine::{QueryError, QueryResponse, RetrievalService, Source};
pub use reconcile::{ReconciliationError, ReconciliationService, ReindexFailure, ReindexFilter, ReindexSummary};
