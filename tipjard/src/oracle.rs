//! BTC/USD exchange rate oracle.
//!
//! Fans out to several independent public price feeds and takes the median,
//! so a single misbehaving or manipulated feed can't skew the quote. The
//! result is cached for a few minutes to bound upstream load.

use std::{
    fmt,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use serde_json::Value as Json;

/// How long a successfully fetched quote is served from cache.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Hard timeout for a single price feed request.
const PRICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// Could not set up the HTTP client.
    Setup(String),
    /// Every price source failed.
    NoPricesAvailable,
}

impl fmt::Display for OracleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Setup(e) => write!(f, "Error setting up the price oracle: {}", e),
            Self::NoPricesAvailable => write!(f, "No price source is currently available."),
        }
    }
}

impl std::error::Error for OracleError {}

/// Where we get USD-per-BTC quotes from.
pub trait PriceOracle: Send {
    /// The current USD-per-BTC quote. Served from cache within the TTL of a
    /// successful fetch.
    fn usd_per_btc(&self) -> Result<f64, OracleError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceSource {
    Coinbase,
    Kraken,
    Binance,
}

/// All variants of `PriceSource`.
pub const ALL_PRICE_SOURCES: [PriceSource; 3] = [
    PriceSource::Coinbase,
    PriceSource::Kraken,
    PriceSource::Binance,
];

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Coinbase => write!(f, "coinbase"),
            Self::Kraken => write!(f, "kraken"),
            Self::Binance => write!(f, "binance"),
        }
    }
}

impl PriceSource {
    /// The URL quoting the USD spot price for this source.
    pub fn spot_price_url(&self) -> &'static str {
        match self {
            Self::Coinbase => "https://api.coinbase.com/v2/prices/spot?currency=USD",
            Self::Kraken => "https://api.kraken.com/0/public/Ticker?pair=XBTUSD",
            Self::Binance => "https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT",
        }
    }

    /// Extract the quoted USD price from this source's response.
    pub fn parse_price_data(&self, data: &Json) -> Option<f64> {
        match self {
            Self::Coinbase => data.get("data")?.get("amount")?.as_str()?.parse().ok(),
            Self::Kraken => data
                .get("result")?
                .get("XXBTZUSD")?
                .get("c")?
                .get(0)?
                .as_str()?
                .parse()
                .ok(),
            Self::Binance => data.get("price")?.as_str()?.parse().ok(),
        }
    }
}

// The median of the quotes, averaging the two middle values for even
// counts. None if no quote survived.
fn median(quotes: &mut Vec<f64>) -> Option<f64> {
    if quotes.is_empty() {
        return None;
    }
    quotes.sort_by(|a, b| a.partial_cmp(b).expect("insane quotes were dropped"));
    let mid = quotes.len() / 2;
    Some(if quotes.len() % 2 == 0 {
        (quotes[mid - 1] + quotes[mid]) / 2.0
    } else {
        quotes[mid]
    })
}

struct CachedPrice {
    quote: f64,
    fetched_at: Instant,
}

/// The production oracle: concurrent fan-out to all price sources, median
/// aggregation, single-slot cache.
pub struct MedianPriceOracle {
    client: reqwest::blocking::Client,
    sources: Vec<PriceSource>,
    cache: Mutex<Option<CachedPrice>>,
}

impl MedianPriceOracle {
    pub fn new() -> Result<Self, OracleError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(PRICE_TIMEOUT)
            .build()
            .map_err(|e| OracleError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            sources: ALL_PRICE_SOURCES.to_vec(),
            cache: Mutex::new(None),
        })
    }

    // Query all sources concurrently, drop the failures, return the median.
    fn fetch_median(&self) -> Option<f64> {
        let mut handles = Vec::with_capacity(self.sources.len());
        for source in self.sources.iter().copied() {
            let client = self.client.clone();
            handles.push((
                source,
                thread::spawn(move || -> Option<f64> {
                    let resp = client.get(source.spot_price_url()).send().ok()?;
                    if !resp.status().is_success() {
                        return None;
                    }
                    let data: Json = resp.json().ok()?;
                    source.parse_price_data(&data)
                }),
            ));
        }

        let mut quotes = Vec::with_capacity(handles.len());
        for (source, handle) in handles {
            match handle.join() {
                Ok(Some(quote)) if quote.is_finite() && quote > 0.0 => quotes.push(quote),
                Ok(Some(quote)) => {
                    log::warn!("Price source '{}' returned an insane quote: {}.", source, quote)
                }
                Ok(None) => log::warn!("Price source '{}' failed.", source),
                Err(_) => log::error!("Price source '{}' fetcher panicked.", source),
            }
        }
        median(&mut quotes)
    }
}

impl PriceOracle for MedianPriceOracle {
    fn usd_per_btc(&self) -> Result<f64, OracleError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < PRICE_CACHE_TTL {
                    return Ok(cached.quote);
                }
            }
        }

        let quote = self
            .fetch_median()
            .ok_or(OracleError::NoPricesAvailable)?;
        log::debug!("Fetched a fresh BTC/USD quote: {}.", quote);
        let mut cache = self.cache.lock().unwrap();
        *cache = Some(CachedPrice {
            quote,
            fetched_at: Instant::now(),
        });
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_aggregation() {
        assert_eq!(median(&mut vec![]), None);
        assert_eq!(median(&mut vec![45_000.0]), Some(45_000.0));
        // Odd count: the middle value, insensitive to one outlier.
        assert_eq!(
            median(&mut vec![45_100.0, 1.0, 44_900.0]),
            Some(44_900.0)
        );
        assert_eq!(
            median(&mut vec![45_000.0, 45_100.0, 44_900.0]),
            Some(45_000.0)
        );
        // Even count: average of the two middle values.
        assert_eq!(
            median(&mut vec![45_200.0, 44_900.0, 45_000.0, 45_100.0]),
            Some(45_050.0)
        );
    }

    #[test]
    fn parse_coinbase() {
        let data = serde_json::json!({
            "data": { "base": "BTC", "currency": "USD", "amount": "45000.015" }
        });
        assert_eq!(
            PriceSource::Coinbase.parse_price_data(&data),
            Some(45_000.015)
        );
        assert_eq!(
            PriceSource::Coinbase.parse_price_data(&serde_json::json!({})),
            None
        );
    }

    #[test]
    fn parse_kraken() {
        let data = serde_json::json!({
            "error": [],
            "result": {
                "XXBTZUSD": {
                    "a": ["45001.0", "1", "1.0"],
                    "c": ["45000.5", "0.01"]
                }
            }
        });
        assert_eq!(PriceSource::Kraken.parse_price_data(&data), Some(45_000.5));
        assert_eq!(
            PriceSource::Kraken.parse_price_data(&serde_json::json!({"error": ["nope"]})),
            None
        );
    }

    #[test]
    fn parse_binance() {
        let data = serde_json::json!({ "symbol": "BTCUSDT", "price": "45000.00" });
        assert_eq!(PriceSource::Binance.parse_price_data(&data), Some(45_000.0));
        assert_eq!(
            PriceSource::Binance.parse_price_data(&serde_json::json!({"price": 45000.0})),
            None
        );
    }
}
