use std::fmt;
use std::time::Duration;

/// Relative expirations above this many seconds (30 days) are absolute unix timestamps.
pub const RELATIVE_EXPIRY_THRESHOLD: u64 = 30 * 24 * 60 * 60;

/// Expiration of an entry, in the encoding every store interprets identically.
///
/// - `0` never expires
/// - `1..=RELATIVE_EXPIRY_THRESHOLD` is a number of seconds from now
/// - anything larger is an absolute unix timestamp in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Expiry(u64);

impl Expiry {
    /// The entry never expires.
    pub const NEVER: Expiry = Expiry(0);

    /// Wrap a raw encoded value.
    pub const fn from_raw(raw: u64) -> Self {
        Expiry(raw)
    }

    /// Expire `secs` seconds from now.
    ///
    /// Durations longer than the relative threshold are converted to an
    /// absolute timestamp so they are not misread as one.
    pub fn after_secs(secs: u64) -> Self {
        if secs > RELATIVE_EXPIRY_THRESHOLD {
            Expiry((crate::utils::now_secs().max(0) as u64).saturating_add(secs))
        } else {
            Expiry(secs.max(1))
        }
    }

    /// Expire after the given duration, rounded up to whole seconds.
    pub fn from_duration(duration: Duration) -> Self {
        let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
        Self::after_secs(secs)
    }

    /// Expire at the given unix timestamp (seconds).
    ///
    /// Timestamps small enough to be read as relative are pushed just past
    /// the threshold, which is always in the past and so already expired.
    pub fn at_unix(timestamp: u64) -> Self {
        Expiry(timestamp.max(RELATIVE_EXPIRY_THRESHOLD + 1))
    }

    /// The raw encoded value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Whether this expiry means "never expire".
    pub fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Absolute deadline in unix seconds, `None` if the entry never expires.
    pub fn resolve(self, now_secs: i64) -> Option<i64> {
        match self.0 {
            0 => None,
            secs if secs <= RELATIVE_EXPIRY_THRESHOLD => Some(now_secs + secs as i64),
            ts => Some(ts.min(i64::MAX as u64) as i64),
        }
    }

    /// Whether an entry written with this expiry at `now_secs` is already dead.
    pub fn is_past(self, now_secs: i64) -> bool {
        self.resolve(now_secs).is_some_and(|at| at <= now_secs)
    }
}

impl From<u64> for Expiry {
    fn from(raw: u64) -> Self {
        Expiry(raw)
    }
}

/// Opaque optimistic-concurrency token.
///
/// Each store decides its own encoding. A token only ever compares equal to
/// a token handed out by the same store for the same state of the entry.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CasToken(Vec<u8>);

impl CasToken {
    /// Wrap raw token bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        CasToken(bytes.into())
    }

    /// Token for a monotonically increasing entry version.
    pub fn from_version(version: u64) -> Self {
        CasToken(version.to_be_bytes().to_vec())
    }

    /// The raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CasToken(")?;
        for byte in self.0.iter().take(16) {
            write!(f, "{:02x}", byte)?;
        }
        if self.0.len() > 16 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// A cache hit: the stored payload and the token describing its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// The cached payload. Empty payloads are legitimate values.
    pub value: Vec<u8>,

    /// Token to pass to `cas` to update this exact state.
    pub token: CasToken,
}

impl Item {
    /// Create a new item.
    pub fn new(value: impl Into<Vec<u8>>, token: CasToken) -> Self {
        Item {
            value: value.into(),
            token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_encoding() {
        let now = 1_700_000_000;

        assert_eq!(Expiry::NEVER.resolve(now), None);
        assert_eq!(Expiry::from_raw(60).resolve(now), Some(now + 60));
        assert_eq!(
            Expiry::from_raw(RELATIVE_EXPIRY_THRESHOLD).resolve(now),
            Some(now + RELATIVE_EXPIRY_THRESHOLD as i64)
        );
        assert_eq!(
            Expiry::from_raw(RELATIVE_EXPIRY_THRESHOLD + 1).resolve(now),
            Some(RELATIVE_EXPIRY_THRESHOLD as i64 + 1)
        );
        assert_eq!(Expiry::at_unix(now as u64 + 5).resolve(now), Some(now + 5));
    }

    #[test]
    fn test_expiry_past() {
        let now = 1_700_000_000;

        assert!(!Expiry::NEVER.is_past(now));
        assert!(!Expiry::from_raw(1).is_past(now));
        assert!(Expiry::at_unix(now as u64 - 1).is_past(now));
        assert!(Expiry::at_unix(now as u64).is_past(now));
        // A tiny absolute timestamp cannot be confused with a relative one
        assert!(Expiry::at_unix(10).is_past(now));
    }

    #[test]
    fn test_long_relative_becomes_absolute() {
        let expiry = Expiry::after_secs(RELATIVE_EXPIRY_THRESHOLD * 2);
        assert!(expiry.raw() > RELATIVE_EXPIRY_THRESHOLD);

        let from_duration = Expiry::from_duration(Duration::from_millis(1500));
        assert_eq!(from_duration.raw(), 2);
    }

    #[test]
    fn test_cas_token_equality() {
        assert_eq!(CasToken::from_version(3), CasToken::from_version(3));
        assert_ne!(CasToken::from_version(3), CasToken::from_version(4));
        assert_eq!(format!("{:?}", CasToken::new(vec![0xab])), "CasToken(ab)");
    }
}
