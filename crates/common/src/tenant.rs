use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Declarative state for one tenant, stored as the YAML body under
/// `alertmanager/configs/user/{user_id}`. Timestamps are unix seconds and
/// zero means "never".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub config: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_files: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub deactivated_at: i64,
    #[serde(default)]
    pub deleted_at: i64,
}

impl TenantConfig {
    /// A deactivated or deleted tenant must not have a running engine.
    pub fn is_inactive(&self) -> bool {
        self.deactivated_at > 0 || self.deleted_at > 0
    }

    /// Whether this record was ever written to the store.
    pub fn is_zero(&self) -> bool {
        self.config.is_empty() && self.updated_at == 0 && self.deleted_at == 0
    }
}
