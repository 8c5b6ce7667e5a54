mod cloud_energy;
mod rate_limit;

pub use cloud_energy::CloudEnergySource;
pub use rate_limit::{RateLimiter, RatePermit};

use crate::engine::SourceError;

/// Supplies a valid bearer credential before each remote request.
///
/// The session-refresh subsystem lives behind this trait; the fetch path
/// never retries an expired credential itself, it surfaces `AuthExpired` for
/// the caller to refresh and re-invoke.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, SourceError>;
}

/// Token provider backed by a fixed credential from configuration or the
/// BACKFILL_BEARER_TOKEN environment variable.
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(configured: Option<String>) -> Self {
        let token = std::env::var("BACKFILL_BEARER_TOKEN").ok().or(configured);
        Self { token }
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, SourceError> {
        self.token.clone().ok_or(SourceError::AuthExpired)
    }
}
