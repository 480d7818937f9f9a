//! Helpers shared by every venue adapter: a TTL-cached fetch and the per-stream decode state every delta-family venue
//! needs (order book reconstruction, kline accumulation, trade FIFO).

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::accumulate::{KlineAccumulator, TradeFifo};
use crate::orderbook::OrderBook;

pub const EXCHANGE_INFO_TTL: Duration = Duration::from_secs(7200);

/// A single-slot cache around an async fetch, shared by every adapter's
/// `full_symbol_list` to avoid re-fetching the symbol catalog on every call.
pub struct TtlCache<T: Clone> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached value if still fresh, otherwise calls `fetch` and
    /// caches the result iff `fetch` succeeded. A failed fetch leaves the
    /// stale value in place (if any) so transient REST failures never
    /// invalidate a perfectly usable catalog.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        let mut guard = self.slot.lock().await;
        if let Some((fetched_at, value)) = guard.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Some(value.clone());
            }
        }

        match fetch().await {
            Some(value) => {
                *guard = Some((Instant::now(), value.clone()));
                Some(value)
            }
            None => guard.as_ref().map(|(_, value)| value.clone()),
        }
    }
}

/// Per-stream mutable decode state, one instance per registered stream key.
/// `Ticker` carries none: the last message always replaces the stored value
/// wholesale.
pub enum StreamState {
    OrderBook(OrderBook),
    Kline(KlineAccumulator),
    Trades(TradeFifo),
    Ticker,
}

impl StreamState {
    pub fn order_book_mut(&mut self) -> Option<&mut OrderBook> {
        match self {
            StreamState::OrderBook(book) => Some(book),
            _ => None,
        }
    }

    pub fn kline_mut(&mut self) -> Option<&mut KlineAccumulator> {
        match self {
            StreamState::Kline(acc) => Some(acc),
            _ => None,
        }
    }

    pub fn trades_mut(&mut self) -> Option<&mut TradeFifo> {
        match self {
            StreamState::Trades(fifo) => Some(fifo),
            _ => None,
        }
    }
}

/// Splits `"BASE/QUOTE"` into its parts; `None` if not canonical.
pub fn split_canonical_symbol(symbol: &str) -> Option<(&str, &str)> {
    symbol.split_once('/')
}

/// `"BASE/QUOTE"` from a venue symbol that already concatenates base+quote
/// given a known quote-asset suffix list, longest match first. Shared by
/// venues whose catalog doesn't separately report base/quote assets.
pub fn split_by_known_quotes<'a>(venue_symbol: &'a str, quotes: &[&str]) -> Option<(&'a str, &'a str)> {
    let mut candidates: Vec<&&str> = quotes.iter().collect();
    candidates.sort_by_key(|q| std::cmp::Reverse(q.len()));
    for quote in candidates {
        if venue_symbol.ends_with(quote) && venue_symbol.len() > quote.len() {
            let base = &venue_symbol[..venue_symbol.len() - quote.len()];
            return Some((base, quote));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_cache_returns_fresh_value_without_refetching() {
        let cache: TtlCache<Vec<String>> = TtlCache::new(Duration::from_secs(60));
        let calls = std::sync::atomic::AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_fetch(|| async {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Some(vec!["BTC/USDT".to_string()])
                })
                .await;
            assert_eq!(result, Some(vec!["BTC/USDT".to_string()]));
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_cache_keeps_stale_value_on_failed_refetch() {
        let cache: TtlCache<Vec<String>> = TtlCache::new(Duration::from_millis(1));
        cache.get_or_fetch(|| async { Some(vec!["a".to_string()]) }).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = cache.get_or_fetch(|| async { None }).await;
        assert_eq!(result, Some(vec!["a".to_string()]));
    }

    #[test]
    fn splits_venue_symbol_by_longest_known_quote() {
        assert_eq!(split_by_known_quotes("BTCUSDT", &["USDT", "USD", "BTC"]), Some(("BTC", "USDT")));
        assert_eq!(split_by_known_quotes("ETHBTC", &["USDT", "BTC"]), Some(("ETH", "BTC")));
        assert_eq!(split_by_known_quotes("X", &["USDT"]), None);
    }
}
