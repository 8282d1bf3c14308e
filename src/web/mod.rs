pub mod routes;

use crate::envelope::EnvelopeCodec;
use crate::secret::{CleanupHandle, SecretManager};
use std::sync::Arc;

pub use routes::create_router;

/// Application state for web handlers
#[derive(Clone)]
pub struct AppState {
    pub codec: Arc<EnvelopeCodec>,
    pub secrets: Arc<SecretManager>,
    pub cleanup: CleanupHandle,
    /// Base for `read_url`; falls back to the request's Host header.
    pub public_url: Option<String>,
}

impl AppState {
    pub fn new(
        codec: Arc<EnvelopeCodec>,
        secrets: Arc<SecretManager>,
        cleanup: CleanupHandle,
        public_url: Option<String>,
    ) -> Self {
        Self {
            codec,
            secrets,
            cleanup,
            public_url: public_url.map(|url| url.trim_end_matches('/').to_string()),
        }
    }
}
