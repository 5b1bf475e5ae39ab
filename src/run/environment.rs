//! Description of the machine a run executes on

use serde::Serialize;
use std::collections::BTreeMap;

/// Collected once per run, before the first test starts
#[derive(Debug, Clone, Default, Serialize)]
pub struct Environment {
    pub os_type: String,
    pub os_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub hostname: Option<String>,
    pub runner_version: String,
    /// Extra variables handed to every worker
    pub variables: BTreeMap<String, String>,
}

impl Environment {
    /// Gather the description; this may block, call it off the loop
    pub fn collect(variables: BTreeMap<String, String>) -> Self {
        let info = os_info::get();
        Self {
            os_type: info.os_type().to_string(),
            os_version: info.version().to_string(),
            architecture: info.architecture().map(str::to_string),
            hostname: std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty()),
            runner_version: env!("CARGO_PKG_VERSION").to_string(),
            variables,
        }
    }
}
