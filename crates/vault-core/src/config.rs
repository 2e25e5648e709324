use serde::{Deserialize, Serialize};

/// Per-wallet tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Name under which upgrades are looked up in the release registry.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Deadline applied when a request does not carry one.
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,
    /// Record a Confirm vote from the initiator at request time.
    #[serde(default)]
    pub creator_auto_confirm: bool,
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
    #[serde(default = "default_max_module_bytes")]
    pub max_module_bytes: usize,
    /// Threshold of the bootstrap admin role.
    #[serde(default = "default_role_threshold")]
    pub default_role_threshold: usize,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            default_deadline_secs: default_deadline_secs(),
            creator_auto_confirm: false,
            max_chunk_bytes: default_max_chunk_bytes(),
            max_module_bytes: default_max_module_bytes(),
            default_role_threshold: default_role_threshold(),
        }
    }
}

fn default_app_name() -> String {
    "custody-wallet".to_string()
}

fn default_deadline_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_chunk_bytes() -> usize {
    2_000_000
}

fn default_max_module_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_role_threshold() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: WalletConfig =
            serde_json::from_str(r#"{"creator_auto_confirm": true}"#).unwrap();
        assert!(config.creator_auto_confirm);
        assert_eq!(config.default_deadline_secs, 604_800);
        assert_eq!(config.max_chunk_bytes, 2_000_000);
        assert_eq!(config.default_role_threshold, 1);
    }
}
