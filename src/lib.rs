//! A metered reverse proxy for OpenAI- and Anthropic-compatible LLM APIs,
//! billed against a per-agent balance funded by on-chain SOL/USDC deposits.
//!
//! The three load-bearing subsystems are [`ledger`] (the durable,
//! multi-asset balance store), [`chain`] (on-chain account parsing and the
//! liquid mirror that keeps the ledger in sync), and [`proxy`] (URL-token
//! auth, upstream dispatch, and usage-metered debiting). [`app`] wires
//! them together into one composition root.

pub mod admin;
pub mod app;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod pricing;
pub mod proxy;
