//! # troupe-agent
//!
//! LLM access for Troupe agents.
//!
//! - [`LlmClient`] is the completion seam every agent talks to
//! - [`AnthropicClient`] speaks the Anthropic Messages API with retry and a
//!   per-client circuit breaker
//! - [`RateLimiter`] enforces per-model TPM, daily spend and concurrency
//!   limits; [`RateLimitedClient`] wraps any client with it

mod anthropic;
mod auth;
mod circuit_breaker;
mod llm;
mod rate_limiter;
mod types;

pub use anthropic::AnthropicClient;
pub use auth::{resolve_api_key, ANTHROPIC_KEY_VARS};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use llm::{LlmClient, RateLimitedClient};
pub use rate_limiter::{ModelUsage, RateLimiter, RatePermit};
pub use types::*;
