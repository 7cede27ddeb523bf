//! Redelivery policies and the redelivering error handler.

pub mod policy;
pub mod redelivery;

pub use policy::{ExceptionPolicy, RedeliveryPolicy};
pub use redelivery::RedeliveryErrorHandler;
