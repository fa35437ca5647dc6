//! API credential management.
//!
//! Credentials are optional at the engine level: without them the engine
//! serves public market data and signed calls fail fast. Values are held
//! behind [`SecretString`] so they never reach logs, and every
//! construction path validates through the engine error type.

use std::fmt;

use crate::error::MarketError;

/// Shortest credential the exchange issues; anything below this is a
/// paste error, not a key.
const MIN_CREDENTIAL_LEN: usize = 16;

/// Sensitive string that cannot leak through logging.
///
/// `Debug` prints a fixed redaction and `Display` a short fingerprint;
/// the raw value is only reachable through
/// [`expose_secret`](SecretString::expose_secret).
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        SecretString(value.into())
    }

    /// The raw value, for signing and auth headers only. Never log it.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Log-safe fingerprint: first and last four characters for values
    /// long enough that the middle stays secret, full redaction
    /// otherwise. Counts characters, not bytes, so multibyte input
    /// cannot split a code point.
    pub fn fingerprint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() < MIN_CREDENTIAL_LEN {
            return "<redacted>".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(<redacted>)")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// Validated exchange credentials.
///
/// Construction is the validation boundary: a `Credentials` value that
/// exists is usable for signing. Malformed input surfaces as
/// [`MarketError::Validation`] before any request is attempted.
#[derive(Clone, Debug)]
pub struct Credentials {
    api_key: SecretString,
    api_secret: SecretString,
}

impl Credentials {
    /// Build credentials, rejecting values that cannot be a real key:
    /// empty after trimming, embedded whitespace, or shorter than
    /// anything the exchange issues.
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Result<Self, MarketError> {
        let api_key = Self::validate("api key", api_key.into())?;
        let api_secret = Self::validate("api secret", api_secret.into())?;
        Ok(Self {
            api_key: SecretString::new(api_key),
            api_secret: SecretString::new(api_secret),
        })
    }

    fn validate(field: &str, raw: String) -> Result<String, MarketError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(MarketError::validation(format!("{field} is empty")));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(MarketError::validation(format!(
                "{field} contains embedded whitespace"
            )));
        }
        if value.chars().count() < MIN_CREDENTIAL_LEN {
            return Err(MarketError::validation(format!(
                "{field} is too short to be an exchange credential"
            )));
        }
        Ok(value.to_string())
    }

    /// Load from `BINANCE_API_KEY` / `BINANCE_API_SECRET`.
    ///
    /// Both absent means the engine runs unauthenticated: `Ok(None)`.
    /// One present without the other, or a value that fails validation,
    /// is a configuration error worth failing loudly on.
    pub fn from_env() -> Result<Option<Self>, MarketError> {
        let api_key = std::env::var("BINANCE_API_KEY").ok();
        let api_secret = std::env::var("BINANCE_API_SECRET").ok();
        match (api_key, api_secret) {
            (None, None) => Ok(None),
            (Some(key), Some(secret)) => Self::new(key, secret).map(Some),
            (Some(_), None) => Err(MarketError::validation(
                "BINANCE_API_KEY is set but BINANCE_API_SECRET is missing",
            )),
            (None, Some(_)) => Err(MarketError::validation(
                "BINANCE_API_SECRET is set but BINANCE_API_KEY is missing",
            )),
        }
    }

    /// Key sent as the `X-MBX-APIKEY` header.
    pub fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    /// HMAC signing key.
    pub fn api_secret(&self) -> &SecretString {
        &self.api_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A";

    #[test]
    fn test_debug_never_shows_value() {
        let secret = SecretString::new(KEY);
        assert_eq!(format!("{secret:?}"), "SecretString(<redacted>)");
    }

    #[test]
    fn test_fingerprint_reveals_only_edges() {
        let secret = SecretString::new(KEY);
        let fingerprint = secret.fingerprint();
        assert_eq!(fingerprint, "vmPU...Eh8A");
        assert!(!fingerprint.contains("ZE6mv9"));
    }

    #[test]
    fn test_short_value_fully_redacted() {
        assert_eq!(SecretString::new("hunter2").fingerprint(), "<redacted>");
    }

    #[test]
    fn test_fingerprint_survives_multibyte_input() {
        let secret = SecretString::new("ключключключключключ");
        // Must not panic on char boundaries.
        let _ = secret.fingerprint();
    }

    #[test]
    fn test_new_trims_and_accepts_valid_pair() {
        let creds = Credentials::new(format!("  {KEY}  "), KEY).unwrap();
        assert_eq!(creds.api_key().expose_secret(), KEY);
        assert_eq!(creds.api_secret().expose_secret(), KEY);
    }

    #[test]
    fn test_new_rejects_empty_and_short_values() {
        assert!(matches!(
            Credentials::new("", KEY),
            Err(MarketError::Validation { .. })
        ));
        assert!(matches!(
            Credentials::new(KEY, "   "),
            Err(MarketError::Validation { .. })
        ));
        assert!(matches!(
            Credentials::new("tooshort", KEY),
            Err(MarketError::Validation { .. })
        ));
    }

    #[test]
    fn test_new_rejects_embedded_whitespace() {
        let torn = format!("{} {}", &KEY[..10], &KEY[10..]);
        assert!(matches!(
            Credentials::new(torn, KEY),
            Err(MarketError::Validation { .. })
        ));
    }
}
