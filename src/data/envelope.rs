//! The result envelope delivered to subscribers and one-shot callers.

use crate::error::MarketError;

/// Where the payload of an envelope came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Live WebSocket delivery.
    Push,
    /// REST request (prime, one-shot, or fallback poll).
    Rest,
    /// Served from the in-memory cache.
    Cache,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Push => "push",
            Source::Rest => "rest",
            Source::Cache => "cache",
        }
    }
}

/// Wrapper around every value handed to a subscriber or one-shot caller.
///
/// Exactly one of data/error is present; the constructors are the only way
/// to build an envelope, so the invariant holds for every instance.
/// `timestamp` is the engine-local receive time in epoch milliseconds.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    data: Option<T>,
    error: Option<MarketError>,
    source: Source,
    timestamp: i64,
}

impl<T> Envelope<T> {
    pub fn ok(data: T, source: Source, timestamp: i64) -> Self {
        Self {
            data: Some(data),
            error: None,
            source,
            timestamp,
        }
    }

    pub fn err(error: MarketError, source: Source, timestamp: i64) -> Self {
        Self {
            data: None,
            error: Some(error),
            source,
            timestamp,
        }
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&MarketError> {
        self.error.as_ref()
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_ok(&self) -> bool {
        self.data.is_some()
    }

    /// Consume the envelope, returning the payload or the error.
    pub fn into_result(self) -> Result<T, MarketError> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (None, Some(error)) => Err(error),
            // Unreachable by construction.
            _ => Err(MarketError::validation("envelope without data or error")),
        }
    }

    /// Map the payload type, preserving source and timestamp.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            data: self.data.map(f),
            error: self.error,
            source: self.source,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_side_present() {
        let ok = Envelope::ok(1u32, Source::Rest, 1000);
        assert!(ok.is_ok());
        assert!(ok.data().is_some() && ok.error().is_none());

        let err = Envelope::<u32>::err(MarketError::network("down"), Source::Rest, 1000);
        assert!(!err.is_ok());
        assert!(err.data().is_none() && err.error().is_some());
    }

    #[test]
    fn test_into_result() {
        let ok = Envelope::ok(5u32, Source::Cache, 0);
        assert_eq!(ok.into_result().unwrap(), 5);

        let err = Envelope::<u32>::err(MarketError::network("down"), Source::Push, 0);
        assert!(err.into_result().is_err());
    }

    #[test]
    fn test_map_preserves_metadata() {
        let env = Envelope::ok(2u32, Source::Push, 77).map(|v| v * 10);
        assert_eq!(*env.data().unwrap(), 20);
        assert_eq!(env.source(), Source::Push);
        assert_eq!(env.timestamp(), 77);
    }
}
