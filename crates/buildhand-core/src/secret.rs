//! Secrets and per-container secret references.

use serde::{Deserialize, Serialize};

/// A secret declared by the pipeline, to be resolved against the secret
/// store before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SecretSpec {
    /// Name the pipeline refers to the secret by
    #[serde(default)]
    pub name: String,
    /// Key within the secret engine
    #[serde(default)]
    pub key: String,
    /// Secret engine ("native", "vault", ...)
    #[serde(default)]
    pub engine: String,
    /// Secret scope kind ("repo", "org", "shared")
    #[serde(default)]
    pub kind: String,
}

/// A resolved secret. Read-only after population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Secret {
    /// Name the pipeline refers to the secret by
    pub name: String,
    /// Resolved value
    pub value: String,
    /// Secret engine the value came from
    #[serde(default)]
    pub engine: String,
    /// Secret scope kind
    #[serde(default)]
    pub kind: String,
    /// Optional restriction to a single container name
    #[serde(default)]
    pub origin: Option<String>,
}

impl Secret {
    /// Whether the secret may be injected into the named container.
    #[must_use]
    pub fn allows(&self, container_name: &str) -> bool {
        match &self.origin {
            Some(origin) => origin == container_name,
            None => true,
        }
    }
}

/// A container's reference to a secret: inject `source` as env var `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SecretRef {
    /// Secret name to resolve
    pub source: String,
    /// Environment variable to populate
    pub target: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrestricted_secret_allows_all() {
        let secret = Secret {
            name: "token".to_string(),
            value: "hunter2".to_string(),
            ..Secret::default()
        };
        assert!(secret.allows("deploy"));
        assert!(secret.allows("anything"));
    }

    #[test]
    fn test_origin_pins_container() {
        let secret = Secret {
            name: "token".to_string(),
            value: "hunter2".to_string(),
            origin: Some("deploy".to_string()),
            ..Secret::default()
        };
        assert!(secret.allows("deploy"));
        assert!(!secret.allows("test"));
    }
}
