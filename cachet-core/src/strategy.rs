//! Declared storage strategy of a cached entity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a namespace stores its data.
///
/// The strategy is declared per cached entity and checked by the client
/// before any engine contact; the engine itself is strategy-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheStrategy {
    /// The namespace holds one opaque image addressed by the namespace alone.
    Monolithic,
    /// The namespace holds many independently addressable named pages.
    Paged,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::Monolithic => "Monolithic",
            CacheStrategy::Paged => "Paged",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = StrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monolithic" => Ok(CacheStrategy::Monolithic),
            "paged" => Ok(CacheStrategy::Paged),
            _ => Err(StrategyParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid strategy string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyParseError(pub String);

impl fmt::Display for StrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid cache strategy: {}", self.0)
    }
}

impl std::error::Error for StrategyParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse_roundtrip() {
        for strategy in [CacheStrategy::Monolithic, CacheStrategy::Paged] {
            let parsed: CacheStrategy = strategy.as_str().parse().unwrap();
            assert_eq!(strategy, parsed);
        }
    }

    #[test]
    fn test_strategy_parse_is_case_insensitive() {
        assert_eq!(
            "MONOLITHIC".parse::<CacheStrategy>().unwrap(),
            CacheStrategy::Monolithic
        );
        assert_eq!("paged".parse::<CacheStrategy>().unwrap(), CacheStrategy::Paged);
    }

    #[test]
    fn test_strategy_parse_rejects_unknown() {
        let err = "sharded".parse::<CacheStrategy>().unwrap_err();
        assert!(format!("{}", err).contains("sharded"));
    }

    #[test]
    fn test_strategy_serde_roundtrip() {
        let json = serde_json::to_string(&CacheStrategy::Paged).unwrap();
        let back: CacheStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CacheStrategy::Paged);
    }
}
