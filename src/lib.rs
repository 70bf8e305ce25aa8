//! # Gridpilot
//!
//! Volatility-sized grid trading for a single spot pair, with an S1
//! position-rebalancing overlay, a risk gate, an order throttle and a
//! deterministic backtester that drives the exact same tick pipeline.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod routes;
pub mod state;
