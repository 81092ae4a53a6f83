//! `hnsc-core` — the Hybrid Neuro-Symbolic Control plane: a deterministic,
//! policy-governed request orchestrator that routes natural-language
//! requests through a layered pipeline terminating in tool invocations,
//! treating the generator as an untrusted token source.
//!
//! Module layout follows the component numbering used throughout the
//! design documentation (C1 Audit Sink .. C14 Policy Gateway).

pub mod arbitration;
pub mod audit;
pub mod circuit_breaker;
pub mod config;
pub mod controller;
pub mod dual_model;
pub mod logging;
pub mod metrics;
pub mod pii;
pub mod policy_gateway;
pub mod pool;
pub mod rate_limit;
pub mod registry;
pub mod retriever;
pub mod router;
pub mod safety;
pub mod types;
pub mod workflow;

pub mod prelude;
