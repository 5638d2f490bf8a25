//! Resilience around external dependencies.
//!
//! Two independent policies wrap every call: a retry strategy keyed by error
//! category and a circuit breaker keyed by dependency name. Errors are
//! classified and severity-tagged first; critical ones page an operator.

pub mod breaker;
pub mod classify;
mod layer;
pub mod patterns;
pub mod retry;

pub use breaker::{
    AdmittedCall, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker, Permit,
};
pub use classify::{
    classify, ClassifiedError, DependencyError, DependencyErrorKind, ErrorCategory, Severity,
};
pub use layer::{CallContext, CallOutcome, ResilienceError, ResilienceLayer};
pub use patterns::{ErrorPattern, ErrorPatternTracker};
pub use retry::{RetryPolicies, RetryPolicy};
