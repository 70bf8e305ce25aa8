//! # engine::bridge
//!
//! **Exchange Bridge Client** — talks JSON over HTTP to a small REST adapter
//! that sits in front of the exchange.
//!
//! ## Bridge API Contract
//!
//! | Method | Path               | Query / Body                              | Response                                   |
//! |--------|--------------------|-------------------------------------------|--------------------------------------------|
//! | GET    | `/market/ticker`   | `?symbol=`                                | `{ "last": 101.2 }`                        |
//! | GET    | `/market/candles`  | `?symbol=&period=&limit=`                 | `[Candle, …]` oldest first                 |
//! | POST   | `/order/send`      | `{symbol, side, amount, price}`           | `{ "ok": true, "fill_price", "fill_amount" }` |
//! | GET    | `/account/balance` | `?symbol=`                                | `{ base_free, base_total, quote_free, quote_total }` |
//!
//! Every call carries its own timeout.  Balance checks only count
//! `SAFETY_MARGIN` of the free balance as spendable.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::gateway::{BalanceProvider, MarketFeed, OrderGateway};
use crate::error::EngineError;
use crate::models::{Candle, Fill, Side};

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TickerResponse {
    last: f64,
}

#[derive(Debug, Serialize)]
pub struct BridgeOrderRequest<'a> {
    pub symbol: &'a str,
    pub side:   Side,
    pub amount: f64,
    pub price:  f64,
}

#[derive(Debug, Deserialize)]
pub struct BridgeOrderResponse {
    pub ok:          bool,
    pub fill_price:  Option<f64>,
    pub fill_amount: Option<f64>,
    pub message:     Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub base_free:   f64,
    pub base_total:  f64,
    pub quote_free:  f64,
    pub quote_total: f64,
}

impl AccountBalance {
    pub fn total_assets(&self, price: f64) -> f64 {
        self.quote_total + self.base_total * price
    }

    pub fn position_ratio(&self, price: f64) -> f64 {
        let total = self.total_assets(price);
        if total <= 0.0 {
            return 0.0;
        }
        self.base_total * price / total
    }

    /// Only `safety_margin` of the free balance counts as spendable.
    pub fn covers(&self, side: Side, amount: f64, price: f64, safety_margin: f64) -> bool {
        match side {
            Side::Buy  => amount * price <= self.quote_free * safety_margin,
            Side::Sell => amount <= self.base_free * safety_margin,
        }
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeClient {
    http:          reqwest::Client,
    base_url:      String,
    symbol:        String,
    safety_margin: f64,
    timeout:       Duration,
}

impl BridgeClient {
    pub fn new(http: reqwest::Client, cfg: &EngineConfig) -> Self {
        Self {
            http,
            base_url:      cfg.bridge_base_url.trim_end_matches('/').to_string(),
            symbol:        cfg.symbol.clone(),
            safety_margin: cfg.safety_margin,
            timeout:       Duration::from_secs(cfg.call_timeout_secs),
        }
    }

    pub async fn balance(&self) -> Result<AccountBalance, EngineError> {
        self.get_json("/account/balance", &[("symbol", self.symbol.clone())]).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, EngineError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        read_json(&url, response).await
    }
}

fn transport_error(url: &str, e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        warn!(url, "Bridge call timed out");
        return EngineError::Timeout("exchange bridge");
    }
    error!(url, error = %e, "Bridge unreachable");
    EngineError::ExchangeCallFailed(format!("bridge unreachable: {e}"))
}

async fn read_json<T: for<'de> Deserialize<'de>>(url: &str, response: reqwest::Response) -> Result<T, EngineError> {
    // ── HTTP status ───────────────────────────────────────────────────────────
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(url, http_status = %status, body = %body, "Bridge returned HTTP error");
        return Err(EngineError::ExchangeCallFailed(format!("bridge HTTP {status}: {body}")));
    }

    // ── Body ──────────────────────────────────────────────────────────────────
    response.json().await.map_err(|e| {
        error!(url, error = %e, "Bridge response parse failed");
        EngineError::ExchangeCallFailed(format!("bridge response parse error: {e}"))
    })
}

#[async_trait]
impl MarketFeed for BridgeClient {
    async fn last_price(&self) -> Result<f64, EngineError> {
        let ticker: TickerResponse = self
            .get_json("/market/ticker", &[("symbol", self.symbol.clone())])
            .await?;
        debug!(symbol = %self.symbol, last = ticker.last, "Ticker");
        Ok(ticker.last)
    }

    async fn candles(&self, period: &str, count: usize) -> Result<Vec<Candle>, EngineError> {
        let mut candles: Vec<Candle> = self
            .get_json(
                "/market/candles",
                &[
                    ("symbol", self.symbol.clone()),
                    ("period", period.to_string()),
                    ("limit", count.to_string()),
                ],
            )
            .await?;
        // Some bridges return newest first
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }
}

#[async_trait]
impl OrderGateway for BridgeClient {
    async fn submit_order(&self, side: Side, amount: f64, price: f64) -> Result<Fill, EngineError> {
        let url = format!("{}/order/send", self.base_url);
        let order = BridgeOrderRequest { symbol: &self.symbol, side, amount, price };

        info!(
            symbol = %order.symbol,
            side   = %order.side,
            amount = order.amount,
            price  = order.price,
            url    = %url,
            "🚀 [BRIDGE] Sending order"
        );

        let response = self
            .http
            .post(&url)
            .json(&order)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        let resp: BridgeOrderResponse = read_json(&url, response).await?;

        if !resp.ok {
            let msg = format!(
                "bridge rejected order: {}",
                resp.message.as_deref().unwrap_or("unknown")
            );
            warn!("{msg}");
            return Err(EngineError::ExchangeCallFailed(msg));
        }

        let fill = Fill {
            fill_price:  resp.fill_price.unwrap_or(price),
            fill_amount: resp.fill_amount.unwrap_or(amount),
        };
        info!(fill_price = fill.fill_price, fill_amount = fill.fill_amount, "✅ [BRIDGE] Order filled");
        Ok(fill)
    }
}

#[async_trait]
impl BalanceProvider for BridgeClient {
    async fn total_assets(&self, price: f64) -> Result<f64, EngineError> {
        Ok(self.balance().await?.total_assets(price))
    }

    async fn position_ratio(&self, price: f64) -> Result<f64, EngineError> {
        Ok(self.balance().await?.position_ratio(price))
    }

    async fn check_balance(&self, side: Side, amount: f64, price: f64) -> Result<bool, EngineError> {
        let balance = self.balance().await?;
        let ok = balance.covers(side, amount, price, self.safety_margin);
        if !ok {
            debug!(?balance, side = %side, amount, price, "Balance does not cover order");
        }
        Ok(ok)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
