//! Tollgate - Multi-tenant Rate Limiting Service
//!
//! This crate decides, for each incoming request of a tenant, whether it may
//! proceed. Tenants own prioritized rules, each evaluated by one of three
//! counting algorithms (fixed window, sliding window counter, token bucket)
//! whose state lives in a shared store, so every service instance enforces
//! the same limits. Store outages degrade according to a fail-open or
//! fail-closed policy, and a separate per-key guard protects the service's
//! own ingress.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
pub mod tenancy;

#[cfg(test)]
pub(crate) mod testing;
