//! Sync layer configuration.

use serde::{Deserialize, Serialize};

/// Tunables for the stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix reserved for client-side placeholder ids.
    pub placeholder_prefix: String,

    /// Notifications loaded per page.
    pub notification_page_size: usize,

    /// Attempts before a refetch gives up on racing local mutations.
    pub refetch_attempts: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            placeholder_prefix: "temp-".to_string(),
            notification_page_size: 50,
            refetch_attempts: 3,
        }
    }
}

impl SyncConfig {
    /// Whether an id was minted locally and not yet confirmed.
    pub fn is_placeholder(&self, id: &str) -> bool {
        id.starts_with(&self.placeholder_prefix)
    }

    /// Mint a fresh placeholder id.
    pub fn placeholder_id(&self) -> String {
        format!("{}{}", self.placeholder_prefix, uuid::Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"notification_page_size": 10}"#).unwrap();
        assert_eq!(config.notification_page_size, 10);
        assert_eq!(config.placeholder_prefix, "temp-");
        assert_eq!(config.refetch_attempts, 3);
    }

    #[test]
    fn test_placeholder_ids_are_unique_and_recognised() {
        let config = SyncConfig::default();
        let a = config.placeholder_id();
        let b = config.placeholder_id();
        assert_ne!(a, b);
        assert!(config.is_placeholder(&a));
        assert!(!config.is_placeholder("3f2c0c1e"));
    }
}
