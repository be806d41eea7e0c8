pub mod identifiers;
pub mod idempotency;
pub mod lock;
pub mod metrics_consts;
pub mod queue;
pub mod retry;
pub mod store;
pub mod types;
