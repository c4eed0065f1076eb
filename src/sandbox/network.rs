//! Network policy for sandbox containers.

use serde::{Deserialize, Serialize};

/// Network access policy for sandbox containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum NetworkPolicy {
    /// Default bridge network
    #[default]
    AllowAll,
    /// No network access
    Deny,
}

impl NetworkPolicy {
    /// Docker `network_mode` for this policy, if it overrides the default.
    pub fn network_mode(self) -> Option<String> {
        match self {
            Self::AllowAll => None,
            Self::Deny => Some("none".to_string()),
        }
    }
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllowAll => write!(f, "allow-all"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_policy_display() {
        assert_eq!(format!("{}", NetworkPolicy::AllowAll), "allow-all");
        assert_eq!(format!("{}", NetworkPolicy::Deny), "deny");
    }

    #[test]
    fn test_network_mode() {
        assert_eq!(NetworkPolicy::AllowAll.network_mode(), None);
        assert_eq!(NetworkPolicy::Deny.network_mode(), Some("none".to_string()));
    }
}
