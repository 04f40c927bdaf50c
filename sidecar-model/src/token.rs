use std::fmt;

use crate::error::ModelError;

/// A token on the cluster hash ring. Wide enough for both the Murmur3 and
/// Random partitioners.
pub type Token = i128;

/// A contiguous portion of the ring, open at `start` and closed at `end`,
/// i.e. `(start, end]`, matching how Cassandra reports ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TokenRange {
    start: Token,
    end: Token,
}

impl TokenRange {
    pub fn new(start: Token, end: Token) -> Result<Self, ModelError> {
        if start >= end {
            return Err(ModelError::InvalidValue(format!(
                "token range start {start} must be below end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Token {
        self.start
    }

    pub fn end(&self) -> Token {
        self.end
    }

    pub fn contains(&self, token: Token) -> bool {
        token > self.start && token <= self.end
    }

    pub fn encloses(&self, other: &TokenRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    pub fn intersects(&self, other: &TokenRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping part of two ranges, if any.
    pub fn intersection(&self, other: &TokenRange) -> Option<TokenRange> {
        if !self.intersects(other) {
            return None;
        }
        Some(TokenRange {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end)
    }
}
