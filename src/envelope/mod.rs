//! Envelope encryption for stored secrets.
//!
//! A secret is sealed with a passcode the server never persists; only the
//! versioned ciphertext blob reaches the backing store.

pub mod codec;
pub mod passcode;

pub use codec::{CryptoConfig, EnvelopeCodec, EnvelopeError, EnvelopeResult, EnvelopeVersion};
pub use passcode::generate_passcode;
