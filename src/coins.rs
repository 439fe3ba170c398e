//! Fixed-point coin amounts.
//!
//! Balances are stored in hundredths so that repeated small bonuses
//! (0.10 per event) sum exactly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coins(u64);

impl Coins {
    pub const ZERO: Coins = Coins(0);

    pub fn from_cents(cents: u64) -> Self {
        Coins(cents)
    }

    pub fn whole(units: u64) -> Self {
        Coins(units.saturating_mul(100))
    }

    pub fn saturating_add(self, other: Coins) -> Coins {
        Coins(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCoinsError {
    pub input: String,
}

impl fmt::Display for ParseCoinsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid coin amount: {:?}", self.input)
    }
}

impl std::error::Error for ParseCoinsError {}

impl FromStr for Coins {
    type Err = ParseCoinsError;

    /// Accepts `5`, `5.0`, `0.1`, `12.34`. More than two decimals is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCoinsError { input: s.to_string() };
        let trimmed = s.trim();
        let (whole, frac) = match trimmed.split_once('.') {
            Some((w, f)) => (w, f),
            None => (trimmed, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if frac.len() > 2 || !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let units: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| err())? };
        let cents: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| err())? * 10,
            _ => frac.parse().map_err(|_| err())?,
        };
        units
            .checked_mul(100)
            .and_then(|c| c.checked_add(cents))
            .map(Coins)
            .ok_or_else(err)
    }
}
