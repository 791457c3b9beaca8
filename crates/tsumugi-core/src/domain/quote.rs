//! Demo payload types for the quote pipeline.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A bid/ask pair, the raw input of the demo pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    /// Random quote with both legs drawn uniformly from `[0.01, 3.5]`.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            bid: rng.gen_range(0.01..=3.5),
            ask: rng.gen_range(0.01..=3.5),
        }
    }

    pub fn midpoint(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// A quote enriched with its midpoint, the output of the transform stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Midpoint {
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
}

impl From<Quote> for Midpoint {
    fn from(quote: Quote) -> Self {
        Self {
            bid: quote.bid,
            ask: quote.ask,
            mid: quote.midpoint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_is_the_average_of_bid_and_ask() {
        let quote = Quote { bid: 1.0, ask: 2.0 };
        let mid = Midpoint::from(quote);

        assert_eq!(mid.bid, 1.0);
        assert_eq!(mid.ask, 2.0);
        assert_eq!(mid.mid, 1.5);
    }

    #[test]
    fn random_quotes_stay_in_range() {
        for _ in 0..100 {
            let quote = Quote::random();
            assert!(quote.bid >= 0.01 && quote.bid <= 3.5);
            assert!(quote.ask >= 0.01 && quote.ask <= 3.5);
        }
    }
}
