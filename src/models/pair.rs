//! Trading pair identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A base/quote market pair, rendered canonically as `"BASE/QUOTE"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    /// Canonical `"BASE/QUOTE"` rendering.
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid pair: {0}")]
pub struct PairParseError(String);

impl FromStr for Pair {
    type Err = PairParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| PairParseError(s.to_string()))?;
        let base = base.trim();
        let quote = quote.trim();
        if base.is_empty() || quote.is_empty() || base.eq_ignore_ascii_case(quote) {
            return Err(PairParseError(s.to_string()));
        }
        Ok(Pair::new(base, quote))
    }
}

impl TryFrom<String> for Pair {
    type Error = PairParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Pair> for String {
    fn from(pair: Pair) -> Self {
        pair.canonical()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let pair: Pair = "ETH/USDC".parse().unwrap();
        assert_eq!(pair.base, "ETH");
        assert_eq!(pair.quote, "USDC");
        assert_eq!(pair.to_string(), "ETH/USDC");
    }

    #[test]
    fn test_lowercase_normalized() {
        let pair: Pair = "eth/usdc".parse().unwrap();
        assert_eq!(pair.canonical(), "ETH/USDC");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("ETHUSDC".parse::<Pair>().is_err());
        assert!("/USDC".parse::<Pair>().is_err());
        assert!("ETH/".parse::<Pair>().is_err());
        assert!("ETH/ETH".parse::<Pair>().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let pair = Pair::new("BTC", "USDC");
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, "\"BTC/USDC\"");
        let back: Pair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair);
    }
}
