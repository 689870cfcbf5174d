// =============================================================================
// Venue Gateway — uniform façade over the two venues' order/account APIs
// =============================================================================
//
// Traders and feeds talk to `dyn VenueGateway` only; the concrete adapters
// (binance, bybit, sim) hide authentication, signing, rate limiting, and
// response-shape differences. Every operation is failable with a typed
// error; transient failures are retried with full-jitter backoff before they
// surface.
// =============================================================================

pub mod binance;
pub mod bybit;
pub mod ratelimit;
pub mod sim;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::types::{Order, Side, SymbolMeta, Ticker, Venue};

/// Typed gateway failure.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Connection/timeout level failure before an HTTP status was obtained.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx HTTP status without a structured venue error.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    /// Explicit venue rejection with a structured code.
    #[error("venue rejected request (code {code}): {message}")]
    Venue { code: i64, message: String },

    /// 429 / venue rate-limit response.
    #[error("rate limited by venue")]
    RateLimited,

    /// Response arrived but did not have the expected shape.
    #[error("malformed venue response: {0}")]
    Protocol(String),

    /// The venue does not know this order (also returned for
    /// "too late to cancel" responses).
    #[error("order {0} not found on venue")]
    OrderNotFound(String),

    /// Request is invalid in this configuration (e.g. order entry on a
    /// fetch-only venue).
    #[error("{0}")]
    Domain(String),
}

impl GatewayError {
    /// Transient errors are worth retrying; the rest surface immediately.
    /// A malformed response counts as transient the first time around and
    /// only surfaces once it repeats through the retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited | Self::Protocol(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Capability interface over one venue. Concrete adapters are stateless per
/// call and safe to share across traders.
#[async_trait]
pub trait VenueGateway: Send + Sync {
    fn venue(&self) -> Venue;

    /// False when the venue is configured fetch-only (read-only feed).
    fn order_entry_enabled(&self) -> bool;

    /// All tradable perpetual symbols in the quote currency, with sizing
    /// metadata. Dated contracts are excluded.
    async fn fetch_symbols(&self) -> GatewayResult<Vec<SymbolMeta>>;

    /// Metadata for a single symbol.
    async fn symbol_meta(&self, symbol: &str) -> GatewayResult<SymbolMeta>;

    async fn fetch_tickers(&self) -> GatewayResult<HashMap<String, Ticker>>;

    /// 24h quote-currency notional per symbol.
    async fn fetch_volumes_24h(&self) -> GatewayResult<HashMap<String, f64>>;

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<Order>;

    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> GatewayResult<Order>;

    /// Fetch current order state. Terminal states are stable.
    async fn fetch_order(&self, id: &str, symbol: &str) -> GatewayResult<Order>;

    /// Request cancellation. Venues answer "order not exists / too late to
    /// cancel" for already-final orders; that surfaces as
    /// [`GatewayError::OrderNotFound`] and is resolved by
    /// [`cancel_order_safe`].
    async fn cancel_order(&self, id: &str, symbol: &str) -> GatewayResult<Order>;

    /// Idempotent: "leverage not modified" responses count as success.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()>;

    /// Idempotent: "already isolated" responses count as success.
    async fn set_isolated_margin(&self, symbol: &str) -> GatewayResult<()>;

    /// Free balance of `asset`.
    async fn fetch_balance(&self, asset: &str) -> GatewayResult<f64>;
}

// =============================================================================
// Idempotent cancellation
// =============================================================================

/// Cancel an order and return its final state.
///
/// Success is either a 2xx cancel response or a follow-up fetch showing the
/// order already terminal ("order not exists / too late to cancel" collapses
/// to success when the fetch confirms). Repeating the call on a terminal
/// order succeeds again without sending a second effective cancel.
pub async fn cancel_order_safe(
    gateway: &dyn VenueGateway,
    id: &str,
    symbol: &str,
) -> GatewayResult<Order> {
    match gateway.cancel_order(id, symbol).await {
        // The cancel went through; the follow-up fetch is authoritative for
        // the final fill quantities.
        Ok(_) => gateway.fetch_order(id, symbol).await,
        Err(GatewayError::OrderNotFound(_)) => {
            let order = gateway.fetch_order(id, symbol).await?;
            if order.is_terminal() {
                debug!(
                    venue = %gateway.venue(),
                    order_id = id,
                    status = %order.status,
                    "cancel resolved to already-terminal order"
                );
                Ok(order)
            } else {
                Err(GatewayError::Protocol(format!(
                    "venue reported order {id} unknown but fetch shows status {}",
                    order.status
                )))
            }
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// Retry helper
// =============================================================================

/// Number of attempts for transient failures.
const RETRY_ATTEMPTS: u32 = 3;
/// Base backoff delay.
const RETRY_BASE: Duration = Duration::from_millis(500);
/// Backoff ceiling.
const RETRY_CAP: Duration = Duration::from_secs(10);

/// Full-jitter backoff delay for the given (0-based) attempt.
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let exp = attempt.min(10);
    let cap = RETRY_BASE
        .saturating_mul(1u32 << exp.min(5))
        .min(RETRY_CAP);
    let millis = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Run `op` up to [`RETRY_ATTEMPTS`] times, sleeping a jittered backoff
/// between transient failures. Non-transient errors surface immediately.
pub(crate) async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < RETRY_ATTEMPTS => {
                let delay = retry_delay(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient gateway error; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_classification() {
        assert!(GatewayError::Transport("reset".into()).is_transient());
        assert!(GatewayError::RateLimited.is_transient());
        assert!(GatewayError::Protocol("truncated body".into()).is_transient());
        assert!(GatewayError::Http { status: 503, body: String::new() }.is_transient());
        assert!(!GatewayError::Http { status: 400, body: String::new() }.is_transient());
        assert!(!GatewayError::Venue { code: -2011, message: String::new() }.is_transient());
        assert!(!GatewayError::OrderNotFound("1".into()).is_transient());
        assert!(!GatewayError::Domain("fetch_only".into()).is_transient());
    }

    #[test]
    fn retry_delay_stays_under_cap() {
        for attempt in 0..12 {
            assert!(retry_delay(attempt) <= RETRY_CAP);
        }
    }

    #[tokio::test]
    async fn with_retry_retries_transient_then_succeeds() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);

        let result: GatewayResult<u32> = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(GatewayError::Transport("flaky".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn with_retry_surfaces_permanent_errors_immediately() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);

        let result: GatewayResult<u32> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GatewayError::Venue {
                    code: -1,
                    message: "bad request".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_budget() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);

        let result: GatewayResult<u32> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::RateLimited) }
        })
        .await;

        assert!(matches!(result, Err(GatewayError::RateLimited)));
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }
}
