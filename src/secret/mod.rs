//! Single-read secrets: policy, lifecycle transitions and counter cleanup.

pub mod cleanup;
pub mod lifecycle;
pub mod policy;

pub use cleanup::CleanupHandle;
pub use lifecycle::{
    attempts_key, secret_key, ConsumeOutcome, FailureReport, SecretError, SecretManager,
    SecretResult, MAX_TX_ATTEMPTS,
};
pub use policy::{AccessPolicy, ExpiryOption, DEFAULT_EXPIRY, EXPIRY_OPTIONS};
