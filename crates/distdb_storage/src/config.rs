//! Store configuration.

use crate::security::SecurityOption;

/// Largest block a single sync read may request.
pub const MAX_SYNC_BLOCK_SIZE: usize = 30 * 1024 * 1024;

/// Identity of a store within its owning application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StoreProperties {
    /// Owning user.
    pub user_id: String,
    /// Owning application.
    pub app_id: String,
    /// Store name.
    pub store_id: String,
}

impl StoreProperties {
    /// Creates store properties.
    pub fn new(
        user_id: impl Into<String>,
        app_id: impl Into<String>,
        store_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            app_id: app_id.into(),
            store_id: store_id.into(),
        }
    }
}

/// How received records that touch this device's own data are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolvePolicy {
    /// Newest timestamp wins regardless of origin.
    #[default]
    LastWin,
    /// Remote records never replace data authored here, and records this
    /// device authored are not re-imported from peers.
    DenyOtherDevAmendCurDevData,
}

/// Configuration for a sync store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store identity used for permission checks.
    pub properties: StoreProperties,
    /// Local security option; `None` means labels are not supported.
    pub security_option: Option<SecurityOption>,
    /// Conflict policy for received records.
    pub conflict_policy: ConflictResolvePolicy,
    /// Upper bound for the block size of one sync read.
    pub max_sync_block_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            properties: StoreProperties::new("default", "default", "default"),
            security_option: None,
            conflict_policy: ConflictResolvePolicy::default(),
            max_sync_block_size: MAX_SYNC_BLOCK_SIZE,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration for the given store identity.
    pub fn new(properties: StoreProperties) -> Self {
        Self {
            properties,
            ..Self::default()
        }
    }

    /// Sets the local security option.
    #[must_use]
    pub fn with_security_option(mut self, option: SecurityOption) -> Self {
        self.security_option = Some(option);
        self
    }

    /// Sets the conflict policy.
    #[must_use]
    pub fn with_conflict_policy(mut self, policy: ConflictResolvePolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the maximum sync block size.
    #[must_use]
    pub fn with_max_sync_block_size(mut self, size: usize) -> Self {
        self.max_sync_block_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityLabel;

    #[test]
    fn default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.max_sync_block_size, MAX_SYNC_BLOCK_SIZE);
        assert!(config.security_option.is_none());
        assert_eq!(config.conflict_policy, ConflictResolvePolicy::LastWin);
    }

    #[test]
    fn builder() {
        let config = StoreConfig::new(StoreProperties::new("u", "a", "s"))
            .with_security_option(SecurityOption::new(SecurityLabel::S2))
            .with_conflict_policy(ConflictResolvePolicy::DenyOtherDevAmendCurDevData)
            .with_max_sync_block_size(1024);
        assert_eq!(config.properties.store_id, "s");
        assert_eq!(config.max_sync_block_size, 1024);
        assert_eq!(
            config.security_option.map(|option| option.label),
            Some(SecurityLabel::S2)
        );
    }
}
