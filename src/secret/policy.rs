//! Static access policy: allowed expiries and attempt limits.

use serde::Serialize;
use std::time::Duration;

const HOUR: u64 = 60 * 60;

/// Expiry tokens accepted on create, in display order.
pub const EXPIRY_OPTIONS: &[ExpiryOption] = &[
    ExpiryOption { token: "1h", seconds: HOUR },
    ExpiryOption { token: "6h", seconds: 6 * HOUR },
    ExpiryOption { token: "1d", seconds: 24 * HOUR },
    ExpiryOption { token: "3d", seconds: 72 * HOUR },
];

/// Expiry applied when the caller does not choose one.
pub const DEFAULT_EXPIRY: &str = "1d";

/// Wrong passcodes tolerated before a secret is destroyed.
pub const MAX_READ_ATTEMPTS: u32 = 3;

/// Largest accepted plaintext (64 KiB).
pub const MAX_SECRET_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpiryOption {
    pub token: &'static str,
    pub seconds: u64,
}

impl ExpiryOption {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

/// Lookups consulted by the lifecycle manager and the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    max_attempts: u32,
    max_secret_bytes: usize,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_READ_ATTEMPTS,
            max_secret_bytes: MAX_SECRET_BYTES,
        }
    }
}

impl AccessPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_secret_bytes(&self) -> usize {
        self.max_secret_bytes
    }

    pub fn expiry_options(&self) -> &'static [ExpiryOption] {
        EXPIRY_OPTIONS
    }

    /// Duration for an expiry token, or `None` if the token is not allowed.
    pub fn parse_expiry(&self, token: &str) -> Option<Duration> {
        EXPIRY_OPTIONS
            .iter()
            .find(|opt| opt.token == token)
            .map(ExpiryOption::duration)
    }

    /// Like `parse_expiry`, but a missing or empty token means the default.
    pub fn resolve_expiry(&self, token: Option<&str>) -> Option<Duration> {
        match token.map(str::trim) {
            None | Some("") => self.parse_expiry(DEFAULT_EXPIRY),
            Some(token) => self.parse_expiry(token),
        }
    }

    pub fn default_expiry(&self) -> Duration {
        self.parse_expiry(DEFAULT_EXPIRY)
            .unwrap_or(Duration::from_secs(24 * HOUR))
    }

    /// True once `failures` has reached the limit.
    pub fn is_exhausted(&self, failures: u64) -> bool {
        failures >= u64::from(self.max_attempts)
    }

    /// Attempts left after `failures` wrong passcodes.
    pub fn remaining_attempts(&self, failures: u64) -> u32 {
        u64::from(self.max_attempts).saturating_sub(failures) as u32
    }
}
