//! Delivery policies
//!
//! - [`RouteTable`]: where an attempt for a destination host goes
//! - [`RetryPolicy`]: when a soft-failed message is tried again
//! - [`StoreRetryPolicy`]: how transient store failures are retried in place

pub mod retry;
pub mod route;

pub use retry::{RetryDecision, RetryPolicy, StoreRetryPolicy};
pub use route::{ResolvedRoute, Route, RouteError, RouteId, RouteSpec, RouteTable};
