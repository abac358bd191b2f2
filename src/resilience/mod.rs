//! Resilience primitives for upstream calls and inbound traffic.
//!
//! - [`rate_limit`]: per-client request rate limiting for the HTTP API
//! - [`circuit_breaker`]: per-service circuit breaker for upstream calls
//! - [`retry`]: retry with exponential backoff for transient failures

pub mod circuit_breaker;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use retry::{retry_observed, retry_with_policy, RetryPolicy};
