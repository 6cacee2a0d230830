//! Transform-engine boundary.
//!
//! The strategy engine — the component that parses a Geneva-style strategy
//! program and rewrites HTTP request bytes to evade deep packet inspection —
//! is an external collaborator. This crate only consumes it through the
//! traits below: a named strategy is compiled once into an [`HttpStrategy`]
//! handle that is shared immutably across flows, and the server side uses a
//! strategy-agnostic [`RequestNormalizer`] because it cannot know which
//! strategy a given client ran.
//!
//! Normalization is best-effort by design: many strategies insert false
//! headers, duplicate tokens, or reorder fields in ways that are not uniquely
//! invertible. Implementations guarantee a *valid*, well-formed request, not
//! a byte-identical reconstruction of the original.

use std::sync::Arc;

use crate::error::Result;

/// A compiled HTTP transform strategy.
///
/// Handles are immutable after compilation and safe to share across
/// concurrent flows.
pub trait HttpStrategy: Send + Sync {
    /// Rewrite a complete request head (request line and headers, terminated
    /// by `\r\n\r\n`, possibly followed by body bytes) into its on-wire
    /// mangled form.
    fn apply(&self, request: &[u8]) -> Result<Vec<u8>>;

    /// Undo the mangling this strategy performs, producing a well-formed
    /// request. The output is not guaranteed to equal the pre-`apply` input.
    fn normalize(&self, request: &[u8]) -> Result<Vec<u8>>;
}

/// Strategy-agnostic request normalization.
///
/// Implementations must accept both mangled and already-valid requests; a
/// valid request passes through unchanged.
pub trait RequestNormalizer: Send + Sync {
    /// Produce a well-formed request from possibly-mangled request bytes.
    fn normalize(&self, request: &[u8]) -> Result<Vec<u8>>;
}

// Every compiled strategy knows how to normalize its own output.
impl<T: HttpStrategy> RequestNormalizer for T {
    fn normalize(&self, request: &[u8]) -> Result<Vec<u8>> {
        HttpStrategy::normalize(self, request)
    }
}

/// Entry point into the external strategy engine.
pub trait StrategyEngine: Send + Sync {
    /// Compile a strategy program by name or source text.
    fn compile(&self, strategy: &str) -> Result<Arc<dyn HttpStrategy>>;

    /// The engine's generic normalizer, used by listeners that must undo
    /// whatever strategy a client happened to run.
    fn normalizer(&self) -> Arc<dyn RequestNormalizer>;
}
