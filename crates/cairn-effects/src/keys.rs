//! Static group key service

use async_trait::async_trait;
use cairn_core::crypto::GroupSecret;
use cairn_core::effects::KeyEffects;
use cairn_core::{CairnError, GroupId, Result};
use std::collections::HashMap;

/// Key service over a fixed set of group memberships
#[derive(Debug, Clone, Default)]
pub struct StaticKeyService {
    secrets: HashMap<GroupId, GroupSecret>,
}

impl StaticKeyService {
    /// No memberships
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a membership
    pub fn with_group(mut self, group_id: impl Into<GroupId>, secret: GroupSecret) -> Self {
        self.secrets.insert(group_id.into(), secret);
        self
    }
}

#[async_trait]
impl KeyEffects for StaticKeyService {
    async fn group_secret(&self, group_id: &GroupId) -> Result<GroupSecret> {
        self.secrets
            .get(group_id)
            .cloned()
            .ok_or_else(|| CairnError::access_denied(format!("Not a member of group {group_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_group_denied() {
        let keys = StaticKeyService::new().with_group("family", GroupSecret::from_bytes([1; 32]));
        assert!(keys.group_secret(&GroupId::new("family")).await.is_ok());
        let result = keys.group_secret(&GroupId::new("work")).await;
        assert!(matches!(result, Err(CairnError::AccessDenied { .. })));
    }
}
