//! The trading engine: signal components, risk controls, the tick pipeline
//! and the collaborators it runs against.

pub mod backtest;
pub mod bridge;
pub mod gateway;
pub mod grid;
pub mod orchestrator;
pub mod overlay;
pub mod risk;
pub mod scheduler;
pub mod throttle;
pub mod trend;
pub mod volatility;
