use async_trait::async_trait;

use super::types::{FixtureError, Target, TargetPage, TargetSpec};
use crate::config::Credentials;

/// The external collaborator that owns targets
#[async_trait]
pub trait FixtureService: Send + Sync {
    /// Exchange credentials for an access token
    async fn login(&self, credentials: &Credentials) -> Result<String, FixtureError>;

    /// One page (1-based) of the target listing
    async fn list_targets(
        &self,
        token: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TargetPage, FixtureError>;

    async fn create_target(&self, token: &str, spec: &TargetSpec) -> Result<Target, FixtureError>;
}
