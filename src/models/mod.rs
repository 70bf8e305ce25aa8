//! Domain models shared across the engine, the backtester and the HTTP layer.

pub mod candle;
pub mod trade;

pub use candle::Candle;
pub use trade::{Fill, ReasonTag, Side, TradeRecord};
