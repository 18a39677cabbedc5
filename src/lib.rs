//! Custodial EVM wallet and strategy execution core for autonomous agents.
//!
//! Each logical agent owns exactly one externally-owned account whose
//! signing key is held encrypted at rest. The core mediates balance
//! queries, transaction construction, signing, broadcast, and recurring
//! strategy execution, gated by a policy layer enforcing spend ceilings,
//! sliding-window rate limits, and explicit high-value confirmation.
//!
//! # Overview
//!
//! Capabilities are exposed as a fixed set of named tool operations (see
//! [`tools::ToolName`]); transports such as stdio JSON framing, a CLI, or
//! an HTTP adapter sit outside this crate and call
//! [`tools::AgentCore::dispatch`]. Data flows top-down: transport →
//! policy (pre-check) → wallet/strategy → chain client; the journal
//! receives a post-outcome write on every path.
//!
//! Transfers from one address are strictly serialized by a per-address
//! token held from nonce resolution through the nonce-advance commit, so
//! nonces are strictly increasing per sender while different senders
//! proceed in parallel.
//!
//! # Modules
//!
//! - [`chain`] — EVM JSON-RPC seam and multi-endpoint failover client.
//! - [`config`] — Immutable startup configuration with env indirection.
//! - [`error`] — The closed error-kind enumeration callers branch on.
//! - [`journal`] — Append-only invocation journal; rate-limit source of
//!   truth.
//! - [`keystore`] — AEAD-sealed key records and export paths.
//! - [`policy`] — Rate rules, audit writes, secret redaction.
//! - [`shutdown`] — Signal-driven cancellation.
//! - [`store`] — Atomic, versioned JSON persistence.
//! - [`strategy`] — Recurring transfers, the tick state machine, the
//!   scheduler loop.
//! - [`telemetry`] — Tracing subscriber registration.
//! - [`timestamp`] — Unix timestamps and UTC calendar days.
//! - [`tools`] — The fixed tool surface and dispatch.
//! - [`units`] — Native amounts: decimal strings outside, integer wei
//!   inside.
//! - [`wallet`] — Wallet lifecycle and the serialized transfer pipeline.

pub mod chain;
pub mod config;
pub mod error;
pub mod journal;
pub mod keystore;
pub mod policy;
pub mod shutdown;
pub mod store;
pub mod strategy;
pub mod telemetry;
pub mod timestamp;
pub mod tools;
pub mod units;
pub mod wallet;
