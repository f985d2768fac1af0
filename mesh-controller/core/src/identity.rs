use serde::{Deserialize, Serialize};
use std::fmt;

/// The principal matching any authenticated client.
pub const WILDCARD_PRINCIPAL: &str = "*";

/// A workload identity of the form `name.namespace`.
///
/// Identities are derived from Kubernetes service accounts. The principal
/// carried in certificates appends the mesh trust domain:
/// `name.namespace.<trust-domain>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceIdentity(String);

/// A Kubernetes service account reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceAccount {
    pub name: String,
    pub namespace: String,
}

// === impl ServiceIdentity ===

impl ServiceIdentity {
    pub fn new(name: impl AsRef<str>, namespace: impl AsRef<str>) -> Self {
        Self(format!("{}.{}", name.as_ref(), namespace.as_ref()))
    }

    pub fn wildcard() -> Self {
        Self(WILDCARD_PRINCIPAL.to_string())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD_PRINCIPAL
    }

    /// Recovers an identity from a principal, stripping the trust domain.
    pub fn from_principal(principal: &str, trust_domain: &str) -> Self {
        let suffix = format!(".{trust_domain}");
        Self(
            principal
                .strip_suffix(&suffix)
                .unwrap_or(principal)
                .to_string(),
        )
    }

    pub fn to_principal(&self, trust_domain: &str) -> String {
        if self.is_wildcard() {
            return WILDCARD_PRINCIPAL.to_string();
        }
        format!("{}.{}", self.0, trust_domain)
    }

    pub fn name(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.0.split('.').nth(1).unwrap_or_default()
    }

    pub fn to_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            name: self.name().to_string(),
            namespace: self.namespace().to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&ServiceAccount> for ServiceIdentity {
    fn from(sa: &ServiceAccount) -> Self {
        Self::new(&sa.name, &sa.namespace)
    }
}

// === impl ServiceAccount ===

impl ServiceAccount {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn to_service_identity(&self) -> ServiceIdentity {
        ServiceIdentity::from(self)
    }
}

impl fmt::Display for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_round_trips_through_trust_domain() {
        let id = ServiceIdentity::new("bookbuyer", "bookstore");
        let principal = id.to_principal("cluster.local");
        assert_eq!(principal, "bookbuyer.bookstore.cluster.local");
        assert_eq!(
            ServiceIdentity::from_principal(&principal, "cluster.local"),
            id
        );
        assert_eq!(id.name(), "bookbuyer");
        assert_eq!(id.namespace(), "bookstore");
    }

    #[test]
    fn wildcard_principal_is_preserved() {
        let id = ServiceIdentity::from_principal(WILDCARD_PRINCIPAL, "cluster.local");
        assert!(id.is_wildcard());
        assert_eq!(id.to_principal("cluster.local"), WILDCARD_PRINCIPAL);
    }
}
