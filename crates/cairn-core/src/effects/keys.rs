//! Group key service

use crate::crypto::GroupSecret;
use crate::errors::Result;
use crate::identifiers::GroupId;
use async_trait::async_trait;

/// Supplies the shared wrap secret of each group
#[async_trait]
pub trait KeyEffects: Send + Sync {
    /// Secret of `group_id`; `AccessDenied` if this identity is not a member
    async fn group_secret(&self, group_id: &GroupId) -> Result<GroupSecret>;
}
