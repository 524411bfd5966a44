//! Domain service registrations, read from the `[services]` table of
//! `.cogworks/config.toml`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Base URL; the client appends `/v1/validate`.
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Sent as a bearer token when present.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionConfig {
    pub services: BTreeMap<String, ServiceEndpoint>,
}

impl ExtensionConfig {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_config_toml_table_expected_endpoints_with_defaults() {
        let config: ExtensionConfig = toml::from_str(
            r#"
            [interface-checker]
            url = "http://127.0.0.1:7411"

            [simulator]
            url = "http://sim.local"
            timeout_secs = 900
            token = "s3cret"
            "#,
        )
        .expect("valid services table");

        assert_eq!(config.services["interface-checker"].timeout_secs, 120);
        assert_eq!(config.services["simulator"].timeout_secs, 900);
        assert_eq!(config.services["simulator"].token.as_deref(), Some("s3cret"));
    }
}
